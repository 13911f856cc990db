//! The local IPC protocol between the privileged core and its unprivileged
//! peer: a length-prefixed, JSON-encoded request/reply wire
//! format, a typed dispatch table on the server side, and a reconnecting
//! client.

pub mod client;
pub mod server;
pub mod wire;

pub use client::RpcClient;
pub use server::{Handler, RpcServer};
pub use wire::{WireReply, WireRequest};

/// The dotted operation names the server dispatches on.
pub mod methods {
    pub const GET_STATUS: &str = "GetStatus";
    pub const APPLY_CONFIG: &str = "ApplyConfig";
    pub const GET_FLOWS: &str = "GetFlows";
    pub const APPROVE_FLOW: &str = "ApproveFlow";
    pub const DENY_FLOW: &str = "DenyFlow";
    pub const SAFE_APPLY_INTERFACE: &str = "SafeApplyInterface";
    pub const CONFIRM_APPLY_INTERFACE: &str = "ConfirmApplyInterface";
    pub const CANCEL_APPLY_INTERFACE: &str = "CancelApplyInterface";
    pub const GET_NOTIFICATIONS: &str = "GetNotifications";
    pub const UPGRADE: &str = "Upgrade";
}
