//! Inbound request envelope from the main server
//!
//! - `InboundRequest`: `create_account`, `withdraw`, `cancel_withdraw`
//! - `ApiResponse<T>`: unified `{code, msg, data}` reply
//! - `error_codes`: numeric codes carried in replies

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ConnectorError};
use crate::ledger::Opid;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum InboundRequest {
    CreateAccount,
    Withdraw(WithdrawRequest),
    CancelWithdraw { opid: Opid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub opid: Opid,
    /// Destination address
    pub account: String,
    pub amount: Decimal,
}

// ============================================================================
// Responses
// ============================================================================

/// Unified reply: `code` 0 = success, `data` only present on success
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T = serde_json::Value> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == error_codes::SUCCESS
    }
}

impl From<&ConnectorError> for ApiResponse {
    fn from(err: &ConnectorError) -> Self {
        ApiResponse::error(error_code(err), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreated {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAck {
    pub opid: Opid,
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const UNKNOWN_ACCOUNT: i32 = 1002;
    pub const DUPLICATE_REQUEST: i32 = 1003;

    // Operation state (4xxx)
    pub const OPERATION_NOT_FOUND: i32 = 4001;
    pub const ALREADY_EXECUTED: i32 = 4002;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const NODE_UNAVAILABLE: i32 = 5001;
}

pub fn error_code(err: &ConnectorError) -> i32 {
    match err {
        ConnectorError::InvalidAmount | ConnectorError::InvalidParameter(_) => {
            error_codes::INVALID_PARAMETER
        }
        ConnectorError::UnknownAccount(_) => error_codes::UNKNOWN_ACCOUNT,
        ConnectorError::DuplicateRequest(_) => error_codes::DUPLICATE_REQUEST,
        ConnectorError::UnknownOperation(_) => error_codes::OPERATION_NOT_FOUND,
        ConnectorError::AlreadyExecuted(_) => error_codes::ALREADY_EXECUTED,
        ConnectorError::Chain(ChainError::NodeUnreachable(_)) => error_codes::NODE_UNAVAILABLE,
        _ => error_codes::INTERNAL_ERROR,
    }
}
