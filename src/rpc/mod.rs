//! Dispatcher/agent RPC surface
//!
//! Two calls, carried as JSON over HTTP POST:
//!
//! - `GetTest(submitted?, test_files?) -> { path }`, an empty path meaning no more work
//! - `Result(path, json) -> {}`, where `json` is a serialized `TestResult`

mod client;
mod server;

use serde::{Deserialize, Serialize};

pub use client::{RpcClient, RpcError};
pub use server::{router, serve, TestService};

pub const GET_TEST_ROUTE: &str = "/rpc/get-test";
pub const RESULT_ROUTE: &str = "/rpc/result";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTestRequest {
    /// Set when `test_files` carries an agent-discovered file list
    #[serde(default)]
    pub submitted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_files: Vec<String>,
}

impl GetTestRequest {
    pub fn pull() -> Self {
        Self::default()
    }

    pub fn submit(test_files: Vec<String>) -> Self {
        Self {
            submitted: true,
            test_files,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTestResponse {
    #[serde(default)]
    pub path: String,
}

impl GetTestResponse {
    pub fn exhausted() -> Self {
        Self::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.path.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRequest {
    pub path: String,
    pub json: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultResponse {}
