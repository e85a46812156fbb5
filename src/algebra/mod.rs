//! Sparse-expression algebra: linear parts, nonlinear trees, the shared
//! constant pool and symbolic differentiation.

pub mod diff;
pub mod lequ;
pub mod pool;
pub mod tree;

pub use diff::{Deriv, SdTool};
pub use lequ::Lequ;
pub use pool::{Pool, PoolIdx, SpecialFloat};
pub use tree::{Func, NlNode, NlOp, NlTree};
