//! Concrete [`ModelLoader`](crate::runtime::ModelLoader) implementations.

#[cfg(feature = "candle")]
pub mod candle;
