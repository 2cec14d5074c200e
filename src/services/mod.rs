/// Outbound actions: guarded requests and hold gestures.
pub mod actions;
/// Outbound API seam and its error type.
pub mod api;
/// Inbound notification routing.
pub mod dispatcher;
/// REST implementation of the outbound API.
#[cfg(feature = "http-api")]
pub mod http_api;
/// End-of-game aggregates.
pub mod summary;
/// Duration arithmetic and timer display.
pub mod timer;
/// Websocket channel feeding the dispatcher.
#[cfg(feature = "ws-transport")]
pub mod transport;
