//! The transactional overlay: operations, per-key nodes, the ordered
//! transactional index, and transaction lifecycle state.

mod index;
mod manager;
mod op;

pub use index::{TransactionIndex, TransactionNode};
pub use manager::{Transaction, TxnManager, TxnStatus};
pub use op::{OpId, OpKind, TransactionOperation};
