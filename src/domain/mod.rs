pub mod anomaly;
pub mod health;
pub mod market;
pub mod shutdown;

pub use anomaly::*;
pub use health::*;
pub use market::*;
pub use shutdown::*;
