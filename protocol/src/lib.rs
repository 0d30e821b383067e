use thiserror::Error;

/// Well-known port the dispatcher uses for the long-lived control channel.
pub const CONTROL_PORT: u32 = 512;

/// Protocol version spoken by this agent. Peers announcing any other version
/// are rejected during the handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Fixed message header size: type (u32) plus payload length (u32).
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16 MiB) to prevent unbounded allocations from a
/// corrupt length prefix.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Framing: each message is an 8-byte little-endian header (type, length)
/// followed by exactly `length` payload bytes. The length does not include
/// the header. The transport is presumed reliable and in-order, so there is
/// no checksum.

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated {what} payload: {got} bytes (need {need})")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("command line is not NUL-terminated")]
    UnterminatedCmdline,

    #[error("command line has no user separator")]
    MissingSeparator,

    #[error("command line is not valid UTF-8")]
    NonUtf8Cmdline,
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

const WIRE_DATA_STDIN: u32 = 0x190;
const WIRE_DATA_STDOUT: u32 = 0x191;
const WIRE_DATA_STDERR: u32 = 0x192;
const WIRE_DATA_EXIT_CODE: u32 = 0x193;
const WIRE_EXEC_CMDLINE: u32 = 0x200;
const WIRE_JUST_EXEC: u32 = 0x201;
const WIRE_CONNECTION_TERMINATED: u32 = 0x211;
const WIRE_HELLO: u32 = 0x300;

/// Message type tag carried in every frame header.
///
/// Types outside the recognized set decode to [`MsgType::Unknown`] so the
/// control-channel loop can log and skip them instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Version negotiation payload ([`PeerInfo`]).
    Hello,
    /// Dispatch a command with full bidirectional streaming ([`ExecParams`]).
    ExecCmdline,
    /// Dispatch a command with no stdin/stdout ([`ExecParams`]).
    JustExec,
    /// Stdin byte chunk; an empty payload marks end of stream.
    DataStdin,
    /// Stdout byte chunk; an empty payload marks end of stream.
    DataStdout,
    /// Stderr byte chunk; an empty payload marks end of stream.
    DataStderr,
    /// Final exit status of the command ([`ExitStatus`]).
    DataExitCode,
    /// Agent -> dispatcher: a session ended; payload echoes the exec-params
    /// fixed prefix of the original request.
    ConnectionTerminated,
    /// Anything not listed above; the raw tag is preserved for logging.
    Unknown(u32),
}

impl MsgType {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            WIRE_HELLO => MsgType::Hello,
            WIRE_EXEC_CMDLINE => MsgType::ExecCmdline,
            WIRE_JUST_EXEC => MsgType::JustExec,
            WIRE_DATA_STDIN => MsgType::DataStdin,
            WIRE_DATA_STDOUT => MsgType::DataStdout,
            WIRE_DATA_STDERR => MsgType::DataStderr,
            WIRE_DATA_EXIT_CODE => MsgType::DataExitCode,
            WIRE_CONNECTION_TERMINATED => MsgType::ConnectionTerminated,
            other => MsgType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            MsgType::Hello => WIRE_HELLO,
            MsgType::ExecCmdline => WIRE_EXEC_CMDLINE,
            MsgType::JustExec => WIRE_JUST_EXEC,
            MsgType::DataStdin => WIRE_DATA_STDIN,
            MsgType::DataStdout => WIRE_DATA_STDOUT,
            MsgType::DataStderr => WIRE_DATA_STDERR,
            MsgType::DataExitCode => WIRE_DATA_EXIT_CODE,
            MsgType::ConnectionTerminated => WIRE_CONNECTION_TERMINATED,
            MsgType::Unknown(raw) => raw,
        }
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Pack a frame header. `len` is the payload byte count.
pub fn encode_header(ty: MsgType, len: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..4].copy_from_slice(&ty.to_wire().to_le_bytes());
    buf[4..].copy_from_slice(&len.to_le_bytes());
    buf
}

/// Unpack a frame header into its type tag and payload length.
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> (MsgType, u32) {
    let ty = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    (MsgType::from_wire(ty), len)
}

// ---------------------------------------------------------------------------
// hello payload
// ---------------------------------------------------------------------------

/// Size of an encoded [`PeerInfo`]: version plus reserved bytes.
pub const PEER_INFO_SIZE: usize = 8;

/// Version announcement exchanged in `hello` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: u32,
}

impl PeerInfo {
    pub fn encode(&self) -> [u8; PEER_INFO_SIZE] {
        let mut buf = [0u8; PEER_INFO_SIZE];
        buf[..4].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    /// Decode the version field. Trailing reserved bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated {
                what: "peer_info",
                need: 4,
                got: buf.len(),
            });
        }
        Ok(Self {
            version: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }
}

// ---------------------------------------------------------------------------
// exec_params payload
// ---------------------------------------------------------------------------

/// Size of the fixed (domain, port) prefix of an encoded [`ExecParams`].
pub const EXEC_PARAMS_PREFIX_SIZE: usize = 8;

/// Dispatch request: where to open the per-session channel, and what to run.
///
/// `cmdline` is the raw `USER:COMMAND\0` tail; it is carried opaquely here
/// and validated by [`split_cmdline`] when the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    pub connect_domain: u32,
    pub connect_port: u32,
    pub cmdline: Vec<u8>,
}

impl ExecParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EXEC_PARAMS_PREFIX_SIZE + self.cmdline.len());
        buf.extend_from_slice(&self.connect_domain.to_le_bytes());
        buf.extend_from_slice(&self.connect_port.to_le_bytes());
        buf.extend_from_slice(&self.cmdline);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < EXEC_PARAMS_PREFIX_SIZE {
            return Err(WireError::Truncated {
                what: "exec_params",
                need: EXEC_PARAMS_PREFIX_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            connect_domain: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            connect_port: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            cmdline: buf[EXEC_PARAMS_PREFIX_SIZE..].to_vec(),
        })
    }

    /// The fixed (domain, port) prefix, echoed back to the dispatcher in
    /// `connection_terminated`.
    pub fn prefix(&self) -> [u8; EXEC_PARAMS_PREFIX_SIZE] {
        let mut buf = [0u8; EXEC_PARAMS_PREFIX_SIZE];
        buf[..4].copy_from_slice(&self.connect_domain.to_le_bytes());
        buf[4..].copy_from_slice(&self.connect_port.to_le_bytes());
        buf
    }
}

// ---------------------------------------------------------------------------
// exit_status payload
// ---------------------------------------------------------------------------

/// Size of an encoded [`ExitStatus`].
pub const EXIT_STATUS_SIZE: usize = 8;

/// Final result of a command, carried in `data_exit_code` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub return_code: i64,
}

impl ExitStatus {
    pub fn encode(&self) -> [u8; EXIT_STATUS_SIZE] {
        self.return_code.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < EXIT_STATUS_SIZE {
            return Err(WireError::Truncated {
                what: "exit_status",
                need: EXIT_STATUS_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            return_code: i64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
        })
    }
}

// ---------------------------------------------------------------------------
// Command line parsing
// ---------------------------------------------------------------------------

/// Split a raw `USER:COMMAND\0` command line into its user and command parts.
///
/// The trailing NUL is mandatory and the split happens at the first colon,
/// so commands may themselves contain colons.
pub fn split_cmdline(raw: &[u8]) -> Result<(String, String), WireError> {
    let body = match raw.split_last() {
        Some((&0, body)) => body,
        _ => return Err(WireError::UnterminatedCmdline),
    };
    let sep = body
        .iter()
        .position(|&b| b == b':')
        .ok_or(WireError::MissingSeparator)?;
    let user = std::str::from_utf8(&body[..sep]).map_err(|_| WireError::NonUtf8Cmdline)?;
    let cmd = std::str::from_utf8(&body[sep + 1..]).map_err(|_| WireError::NonUtf8Cmdline)?;
    Ok((user.to_owned(), cmd.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Message header
    // -----------------------------------------------------------------------

    #[test]
    fn header_roundtrip() {
        let buf = encode_header(MsgType::DataStdout, 17);
        let (ty, len) = decode_header(&buf);
        assert_eq!(ty, MsgType::DataStdout);
        assert_eq!(len, 17);
    }

    #[test]
    fn header_is_little_endian() {
        let buf = encode_header(MsgType::Hello, 0x0102_0304);
        assert_eq!(&buf[..4], &[0x00, 0x03, 0x00, 0x00]); // 0x300
        assert_eq!(&buf[4..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn unknown_type_survives_roundtrip() {
        let ty = MsgType::from_wire(0xdead);
        assert_eq!(ty, MsgType::Unknown(0xdead));
        assert_eq!(ty.to_wire(), 0xdead);
    }

    #[test]
    fn all_known_types_roundtrip() {
        for ty in [
            MsgType::Hello,
            MsgType::ExecCmdline,
            MsgType::JustExec,
            MsgType::DataStdin,
            MsgType::DataStdout,
            MsgType::DataStderr,
            MsgType::DataExitCode,
            MsgType::ConnectionTerminated,
        ] {
            assert_eq!(MsgType::from_wire(ty.to_wire()), ty);
        }
    }

    // -----------------------------------------------------------------------
    // peer_info
    // -----------------------------------------------------------------------

    #[test]
    fn peer_info_roundtrip() {
        let info = PeerInfo { version: 2 };
        let buf = info.encode();
        assert_eq!(buf.len(), PEER_INFO_SIZE);
        assert_eq!(PeerInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn peer_info_ignores_reserved_tail() {
        let mut buf = [0u8; PEER_INFO_SIZE];
        buf[..4].copy_from_slice(&3u32.to_le_bytes());
        buf[4..].copy_from_slice(&[0xff; 4]);
        assert_eq!(PeerInfo::decode(&buf).unwrap().version, 3);
    }

    #[test]
    fn peer_info_truncated() {
        let err = PeerInfo::decode(&[2, 0]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                what: "peer_info",
                need: 4,
                got: 2
            }
        );
    }

    // -----------------------------------------------------------------------
    // exec_params
    // -----------------------------------------------------------------------

    #[test]
    fn exec_params_roundtrip() {
        let params = ExecParams {
            connect_domain: 7,
            connect_port: 513,
            cmdline: b"alice:cat\0".to_vec(),
        };
        let buf = params.encode();
        assert_eq!(ExecParams::decode(&buf).unwrap(), params);
    }

    #[test]
    fn exec_params_prefix_is_first_eight_bytes() {
        let params = ExecParams {
            connect_domain: 7,
            connect_port: 513,
            cmdline: b"alice:cat\0".to_vec(),
        };
        let buf = params.encode();
        assert_eq!(params.prefix(), buf[..EXEC_PARAMS_PREFIX_SIZE]);
        assert_eq!(params.prefix(), [7, 0, 0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn exec_params_empty_cmdline_tail() {
        let buf = [1, 0, 0, 0, 2, 0, 0, 0];
        let params = ExecParams::decode(&buf).unwrap();
        assert_eq!(params.connect_domain, 1);
        assert_eq!(params.connect_port, 2);
        assert!(params.cmdline.is_empty());
    }

    #[test]
    fn exec_params_truncated_prefix() {
        let err = ExecParams::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            WireError::Truncated {
                what: "exec_params",
                ..
            }
        ));
    }

    // -----------------------------------------------------------------------
    // exit_status
    // -----------------------------------------------------------------------

    #[test]
    fn exit_status_roundtrip() {
        for code in [0i64, 1, 255, -1, i64::MIN, i64::MAX] {
            let status = ExitStatus { return_code: code };
            assert_eq!(ExitStatus::decode(&status.encode()).unwrap(), status);
        }
    }

    #[test]
    fn exit_status_zero_is_all_zero_bytes() {
        let status = ExitStatus { return_code: 0 };
        assert_eq!(status.encode(), [0u8; EXIT_STATUS_SIZE]);
    }

    #[test]
    fn exit_status_truncated() {
        assert!(ExitStatus::decode(&[0; 7]).is_err());
    }

    // -----------------------------------------------------------------------
    // split_cmdline
    // -----------------------------------------------------------------------

    #[test]
    fn cmdline_splits_user_and_command() {
        let (user, cmd) = split_cmdline(b"alice:cat\0").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(cmd, "cat");
    }

    #[test]
    fn cmdline_splits_at_first_colon() {
        let (user, cmd) = split_cmdline(b"bob:echo a:b\0").unwrap();
        assert_eq!(user, "bob");
        assert_eq!(cmd, "echo a:b");
    }

    #[test]
    fn cmdline_allows_empty_parts() {
        let (user, cmd) = split_cmdline(b":\0").unwrap();
        assert!(user.is_empty());
        assert!(cmd.is_empty());
    }

    #[test]
    fn cmdline_without_nul_is_rejected() {
        assert_eq!(
            split_cmdline(b"alice:cat").unwrap_err(),
            WireError::UnterminatedCmdline
        );
    }

    #[test]
    fn cmdline_without_colon_is_rejected() {
        assert_eq!(
            split_cmdline(b"no-separator\0").unwrap_err(),
            WireError::MissingSeparator
        );
    }

    #[test]
    fn empty_cmdline_is_rejected() {
        assert_eq!(
            split_cmdline(b"").unwrap_err(),
            WireError::UnterminatedCmdline
        );
    }

    #[test]
    fn non_utf8_cmdline_is_rejected() {
        assert_eq!(
            split_cmdline(b"a:\xff\xfe\0").unwrap_err(),
            WireError::NonUtf8Cmdline
        );
    }
}
