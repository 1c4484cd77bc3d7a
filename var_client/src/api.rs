use crate::{
    error::ClientError,
    wire::{
        ActionRequest, ActionResponse, DataVariableRequest,
        DerivedVariableRequest, DerivedVariableResponse, StoreValue,
        StoreWriteRequest,
    },
};
use serde_json::Value;
use std::{future::Future, pin::Pin};
use var_graph::extras::RequestExtras;

/// A boxed, thread-safe future.
pub type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The endpoints the runtime calls.
///
/// This is implemented for [`ReqwestClient`](crate::reqwest::ReqwestClient).
/// Tests and alternative transports can implement it directly.
pub trait ServerApi: Send + Sync + 'static {
    /// `POST /derived-variable/{uid}`
    fn derived_variable(
        &self,
        uid: &str,
        request: DerivedVariableRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<DerivedVariableResponse, ClientError>>;

    /// `POST /data-variable/{uid}`
    fn data_variable(
        &self,
        uid: &str,
        request: DataVariableRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<DerivedVariableResponse, ClientError>>;

    /// `POST /action/{uid}`
    fn action(
        &self,
        uid: &str,
        request: ActionRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<ActionResponse, ClientError>>;

    /// `GET /tasks/{task_id}`: the result of a completed long-running task.
    fn task_result(
        &self,
        task_id: &str,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<Value, ClientError>>;

    /// `GET /store/{store_uid}`
    fn get_store(
        &self,
        store_uid: &str,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<StoreValue, ClientError>>;

    /// `POST /store`
    fn write_store(
        &self,
        request: StoreWriteRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<(), ClientError>>;
}

/// Boxes a future into a [`PinnedFuture`].
pub fn pinned<T>(
    fut: impl Future<Output = T> + Send + 'static,
) -> PinnedFuture<T> {
    Box::pin(fut)
}
