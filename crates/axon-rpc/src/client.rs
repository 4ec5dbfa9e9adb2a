use std::{marker::PhantomData, rc::Rc};

use axon_ser::{FromSi, SerializationInfo};
use axon_signal::Signal;
use axon_timing::Timespan;

use crate::RemoteError;

/// The unified client surface every transport implements.
///
/// `call` is synchronous with an optional timeout. `begin`/`end` run the
/// exchange through the selector the client is attached to: `begin`
/// serializes and sends, the `finished` signal reports completion, `end`
/// returns the decoded result or the remote error. `cancel` drops the
/// in-flight request and completes it with a cancellation error.
pub trait RemoteClient {
    fn call(
        &self,
        method: &str,
        args: &[SerializationInfo],
        timeout: Option<Timespan>,
    ) -> Result<SerializationInfo, RemoteError>;

    fn begin(&self, method: &str, args: &[SerializationInfo]) -> Result<(), RemoteError>;

    fn end(&self) -> Result<SerializationInfo, RemoteError>;

    /// Fires once per `begin` when the reply (or failure) is in.
    fn finished(&self) -> &Signal<()>;

    fn cancel(&self);
}

/// A typed handle to one remote procedure.
///
/// Binds a client and a method name and converts results into `R`.
pub struct RemoteProcedure<R: FromSi> {
    client: Rc<dyn RemoteClient>,
    method: String,
    marker: PhantomData<fn() -> R>,
}

impl<R: FromSi> RemoteProcedure<R> {
    pub fn new(client: Rc<dyn RemoteClient>, method: impl Into<String>) -> Self {
        RemoteProcedure { client, method: method.into(), marker: PhantomData }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Synchronous invocation.
    pub fn call(
        &self,
        args: &[SerializationInfo],
        timeout: Option<Timespan>,
    ) -> Result<R, RemoteError> {
        let si = self.client.call(&self.method, args, timeout)?;
        R::from_si(&si).map_err(|e| RemoteError::invalid_params(e.to_string()))
    }

    /// Starts an asynchronous invocation; completion arrives on the
    /// client's `finished` signal.
    pub fn begin(&self, args: &[SerializationInfo]) -> Result<(), RemoteError> {
        self.client.begin(&self.method, args)
    }

    /// Collects the result of a completed asynchronous invocation.
    pub fn end(&self) -> Result<R, RemoteError> {
        let si = self.client.end()?;
        R::from_si(&si).map_err(|e| RemoteError::invalid_params(e.to_string()))
    }

    pub fn finished(&self) -> &Signal<()> {
        self.client.finished()
    }

    pub fn cancel(&self) {
        self.client.cancel();
    }
}
