/// Master connection lifecycle states, matching `masterconn.c`'s `mode`
/// field: `FREE` (no socket, waiting out the reconnection delay),
/// `CONNECTING` (non-blocking `connect()` in flight), `HEADER`/`DATA`
/// (reading a frame, collapsed here into one `Connected` state tracked by
/// the `FrameDecoder`'s own internal phase), and `KILL` (torn down on the
/// next reactor tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Free,
    Connecting,
    Connected,
    Kill,
}
