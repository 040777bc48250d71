use std::any::Any;

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed bidirectional byte stream handed to and returned from dispatchers.
pub type ProxyStream = Box<dyn AsyncStream>;

/// Combination trait for AsyncRead + AsyncWrite trait objects.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
