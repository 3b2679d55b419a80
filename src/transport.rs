//! The byte-stream abstraction the dialer produces and the writer/reader
//! loops consume. Boxed so `Connection` doesn't need to be generic over
//! every transport kind it might be asked to dial.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;
