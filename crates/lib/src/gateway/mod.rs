//! Gateway: one command dispatcher behind two transports on a single port.
//!
//! Request/response (`POST /command`) and streaming (`GET /ws`) both normalize into a
//! [`Command`], pass the [`PolicyLayer`], and are executed by the [`Dispatcher`].

mod command;
mod dispatch;
mod normalize;
mod policy;
mod protocol;
mod registry;
mod server;

pub use command::{Command, CommandResult, ErrorInfo, ErrorKind, OriginKind};
pub use dispatch::{
    handler_fn, Dispatcher, FnHandler, Handler, HandlerError, HandlerOutcome, RegisterMode,
    RegistrationError, TimeoutPolicy,
};
pub use normalize::{
    format_channel, format_http, format_result, http_status, parse_channel_frame, parse_request,
    ChannelFrame, FrameError, RawReply, ReplyTarget,
};
pub use policy::{
    bearer_token, constant_time_eq, Admission, AdmissionRequest, OriginPolicy, PolicyLayer,
    RateLimiter,
};
pub use protocol::{ReplyKind, ServerFrame, PROTOCOL_VERSION};
pub use registry::{ChannelSink, ConnectionId, ConnectionInfo, ConnectionRegistry, Outbound};
pub use server::{build_state, router, run_gateway, serve, GatewayState, MAX_FRAME_BYTES};
