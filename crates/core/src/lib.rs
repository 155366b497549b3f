pub mod category;
pub mod money;
pub mod receipt;

pub use category::{CategorizableTransaction, CategorizationResult, CategoryAlternative};
pub use money::Money;
pub use receipt::{LineItem, ReceiptDocument};
