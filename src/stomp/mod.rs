//! STOMP 1.2 wire protocol: frames, codec and heart-beating

mod codec;
mod frame;
mod heartbeat;

pub use codec::{FrameCodec, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};
pub use frame::{Command, Frame};
pub use heartbeat::{
    negotiate, run_heartbeat_loop, HeartbeatAction, HeartbeatMonitor, HeartbeatPair,
    NegotiatedHeartbeat,
};
