//! 模拟 IoT Hub
//!
//! 进程内的服务端替身，用于故障注入测试与演示程序。

mod fault;
mod hub;
mod session;

pub use fault::{
    CLOSE_REASON_BOOM, CLOSE_REASON_BYEBYE, DEFAULT_DELAY_SECS, DEFAULT_DURATION_SECS,
    FaultInjection, FaultType,
};
pub use hub::{MAX_MESSAGE_BYTES, SimulatedHub};
pub use session::SimulatedSession;
