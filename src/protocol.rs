//! Control-channel protocol: newline-terminated JSON frames carrying
//! `{time, message_id, type, args}`, plus the channel label and window
//! size grammars shared with the data-channel multiplexer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::{AgentError, Result};

/// Terminal dimensions, `rows x cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
}

impl Winsize {
    pub const DEFAULT: Winsize = Winsize { rows: 24, cols: 80 };
}

/// Parses the exact grammar `<rows>x<cols>`, both base-10 u16.
pub fn parse_winsize(s: &str) -> Result<Winsize> {
    let (rows, cols) = s
        .split_once('x')
        .ok_or_else(|| AgentError::Protocol(format!("window size {s:?} is not <rows>x<cols>")))?;
    let rows = rows
        .parse::<u16>()
        .map_err(|err| AgentError::Protocol(format!("bad row count in {s:?}: {err}")))?;
    let cols = cols
        .parse::<u16>()
        .map_err(|err| AgentError::Protocol(format!("bad column count in {s:?}: {err}")))?;
    Ok(Winsize { rows, cols })
}

/// What a freshly opened data channel's label asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLabel {
    /// `%`: the peer's control channel.
    Control,
    /// `>cols,rows,pane_id`: attach to an existing pane and resize it.
    Attach { size: Winsize, pane_id: u32 },
    /// Anything else: spawn a new pane running this command line.
    Command(Vec<String>),
}

pub fn parse_label(label: &str) -> Result<ChannelLabel> {
    if label == "%" {
        return Ok(ChannelLabel::Control);
    }
    if let Some(rest) = label.strip_prefix('>') {
        let mut parts = rest.splitn(3, ',');
        let (cols, rows, pane_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(AgentError::Protocol(format!(
                    "attach label {label:?} is not >cols,rows,pane_id"
                )));
            }
        };
        let cols = cols
            .parse::<u16>()
            .map_err(|err| AgentError::Protocol(format!("bad columns in {label:?}: {err}")))?;
        let rows = rows
            .parse::<u16>()
            .map_err(|err| AgentError::Protocol(format!("bad rows in {label:?}: {err}")))?;
        let pane_id = pane_id
            .parse::<u32>()
            .map_err(|err| AgentError::Protocol(format!("bad pane id in {label:?}: {err}")))?;
        return Ok(ChannelLabel::Attach {
            size: Winsize { rows, cols },
            pane_id,
        });
    }
    let argv: Vec<String> = label.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(AgentError::Protocol("empty channel label".into()));
    }
    Ok(ChannelLabel::Command(argv))
}

/// A pane command may arrive as a single line or as argv.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandField {
    Line(String),
    Argv(Vec<String>),
}

impl CommandField {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            CommandField::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandField::Argv(argv) => argv,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    time: i64,
    message_id: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct AuthArgs {
    token: String,
}

#[derive(Debug, Deserialize)]
struct AddPaneArgs {
    command: CommandField,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ResizeArgs {
    pane_id: u32,
    sx: u16,
    sy: u16,
}

#[derive(Debug, Deserialize)]
struct SetPayloadArgs {
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct RestoreArgs {
    marker: String,
}

#[derive(Debug, Deserialize)]
struct RefArgs {
    #[serde(rename = "ref")]
    ref_id: u32,
    #[serde(default)]
    desc: Option<String>,
}

/// One decoded control request, args already validated per type.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Auth {
        token: String,
    },
    AddPane {
        command: Vec<String>,
        size: Option<Winsize>,
        env: HashMap<String, String>,
    },
    ResizePane {
        pane_id: u32,
        size: Winsize,
    },
    GetPayload,
    SetPayload {
        payload: Value,
    },
    Mark,
    Restore {
        marker: String,
    },
    /// Client-originated ack/nack; the agent only logs these.
    Reply {
        ref_id: u32,
        desc: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub time: i64,
    pub message_id: u32,
}

/// Why a frame could not be honored; `ref_id` is what the nack echoes
/// (0 when the request's message id never decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub ref_id: u32,
    pub desc: String,
}

fn args<T: serde::de::DeserializeOwned>(
    kind: &str,
    ref_id: u32,
    value: Value,
) -> std::result::Result<T, FrameError> {
    serde_json::from_value(value).map_err(|err| FrameError {
        ref_id,
        desc: format!("bad {kind} args: {err}"),
    })
}

/// Parses one newline-stripped control frame.
pub fn parse_frame(line: &str) -> std::result::Result<(ParsedFrame, ControlRequest), FrameError> {
    let raw: RawFrame = serde_json::from_str(line).map_err(|err| FrameError {
        ref_id: 0,
        desc: format!("malformed control frame: {err}"),
    })?;
    if raw.message_id == 0 {
        return Err(FrameError {
            ref_id: 0,
            desc: "message_id must be non-zero".into(),
        });
    }
    let meta = ParsedFrame {
        time: raw.time,
        message_id: raw.message_id,
    };
    let ref_id = raw.message_id;
    let request = match raw.kind.as_str() {
        "auth" => {
            let a: AuthArgs = args("auth", ref_id, raw.args)?;
            ControlRequest::Auth { token: a.token }
        }
        "add_pane" => {
            let a: AddPaneArgs = args("add_pane", ref_id, raw.args)?;
            let size = match a.size.as_deref() {
                Some(s) => Some(parse_winsize(s).map_err(|err| FrameError {
                    ref_id,
                    desc: err.to_string(),
                })?),
                None => None,
            };
            let command = a.command.into_argv();
            if command.is_empty() {
                return Err(FrameError {
                    ref_id,
                    desc: "add_pane requires a command".into(),
                });
            }
            ControlRequest::AddPane {
                command,
                size,
                env: a.env.unwrap_or_default(),
            }
        }
        "resize_pane" => {
            let a: ResizeArgs = args("resize_pane", ref_id, raw.args)?;
            ControlRequest::ResizePane {
                pane_id: a.pane_id,
                size: Winsize {
                    rows: a.sy,
                    cols: a.sx,
                },
            }
        }
        "get_payload" => ControlRequest::GetPayload,
        "set_payload" => {
            let a: SetPayloadArgs = args("set_payload", ref_id, raw.args)?;
            ControlRequest::SetPayload { payload: a.payload }
        }
        "mark" => ControlRequest::Mark,
        "restore" => {
            let a: RestoreArgs = args("restore", ref_id, raw.args)?;
            ControlRequest::Restore { marker: a.marker }
        }
        "ack" | "nack" => {
            let a: RefArgs = args(&raw.kind, ref_id, raw.args)?;
            ControlRequest::Reply {
                ref_id: a.ref_id,
                desc: a.desc,
            }
        }
        other => {
            return Err(FrameError {
                ref_id,
                desc: format!("unknown type {other:?}"),
            });
        }
    };
    Ok((meta, request))
}

#[derive(Serialize)]
struct OutFrame<'a> {
    time: u64,
    message_id: u32,
    #[serde(rename = "type")]
    kind: &'a str,
    args: Value,
}

fn encode(frame: &OutFrame<'_>) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(frame).expect("control frames serialize");
    bytes.push(b'\n');
    bytes
}

/// Encodes an `ack` reply referencing `ref_id`, newline-terminated.
pub fn encode_ack(message_id: u32, time: u64, ref_id: u32, body: Option<Value>) -> Vec<u8> {
    let mut payload = serde_json::Map::new();
    payload.insert("ref".into(), ref_id.into());
    if let Some(body) = body {
        payload.insert("body".into(), body);
    }
    encode(&OutFrame {
        time,
        message_id,
        kind: "ack",
        args: Value::Object(payload),
    })
}

/// Encodes a `nack` reply; `ref_id` 0 marks a system-originated error.
pub fn encode_nack(message_id: u32, time: u64, ref_id: u32, desc: &str) -> Vec<u8> {
    encode(&OutFrame {
        time,
        message_id,
        kind: "nack",
        args: serde_json::json!({ "ref": ref_id, "desc": desc }),
    })
}

/// Accumulates channel payloads and yields complete newline-terminated
/// frames; partial tails stay buffered until the next payload.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim_end_matches('\r');
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn winsize_accepts_rows_by_cols() {
        assert_eq!(
            parse_winsize("24x80").unwrap(),
            Winsize { rows: 24, cols: 80 }
        );
        assert_eq!(parse_winsize("0x0").unwrap(), Winsize { rows: 0, cols: 0 });
    }

    #[test]
    fn winsize_rejects_everything_else() {
        for bad in ["abc", "24", "24x", "-1x10", "70000x10", "x80", ""] {
            assert!(parse_winsize(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn label_forms() {
        assert_eq!(parse_label("%").unwrap(), ChannelLabel::Control);
        assert_eq!(
            parse_label(">80,24,1").unwrap(),
            ChannelLabel::Attach {
                size: Winsize { rows: 24, cols: 80 },
                pane_id: 1
            }
        );
        assert_eq!(
            parse_label("bash -l").unwrap(),
            ChannelLabel::Command(vec!["bash".into(), "-l".into()])
        );
        assert!(parse_label(">80,24").is_err());
        assert!(parse_label(">80,24,nope").is_err());
        assert!(parse_label("").is_err());
    }

    #[test]
    fn auth_frame_parses() {
        let line =
            json!({"time": 1, "message_id": 1, "type": "auth", "args": {"token": "secret"}})
                .to_string();
        let (meta, request) = parse_frame(&line).unwrap();
        assert_eq!(meta.message_id, 1);
        assert_eq!(
            request,
            ControlRequest::Auth {
                token: "secret".into()
            }
        );
    }

    #[test]
    fn add_pane_accepts_string_and_argv_commands() {
        let line = json!({
            "time": 2, "message_id": 2, "type": "add_pane",
            "args": {"command": "/bin/cat", "size": "24x80"}
        })
        .to_string();
        let (_, request) = parse_frame(&line).unwrap();
        assert_eq!(
            request,
            ControlRequest::AddPane {
                command: vec!["/bin/cat".into()],
                size: Some(Winsize { rows: 24, cols: 80 }),
                env: HashMap::new(),
            }
        );

        let line = json!({
            "time": 3, "message_id": 3, "type": "add_pane",
            "args": {"command": ["bash", "-l"]}
        })
        .to_string();
        let (_, request) = parse_frame(&line).unwrap();
        match request {
            ControlRequest::AddPane { command, size, .. } => {
                assert_eq!(command, vec!["bash".to_string(), "-l".to_string()]);
                assert!(size.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_type_reports_ref() {
        let line = json!({"time": 1, "message_id": 9, "type": "dance", "args": {}}).to_string();
        let err = parse_frame(&line).unwrap_err();
        assert_eq!(err.ref_id, 9);
        assert!(err.desc.contains("unknown type"));
    }

    #[test]
    fn zero_message_id_is_rejected() {
        let line = json!({"time": 1, "message_id": 0, "type": "mark"}).to_string();
        let err = parse_frame(&line).unwrap_err();
        assert_eq!(err.ref_id, 0);
    }

    #[test]
    fn malformed_json_uses_system_ref() {
        let err = parse_frame("{not json").unwrap_err();
        assert_eq!(err.ref_id, 0);
        assert!(!err.desc.is_empty());
    }

    #[test]
    fn replies_echo_ref() {
        let ack = encode_ack(7, 100, 3, Some(json!({"pane_id": 1})));
        let value: Value = serde_json::from_slice(&ack).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["args"]["ref"], 3);
        assert_eq!(value["args"]["body"]["pane_id"], 1);
        assert!(ack.ends_with(b"\n"));

        let nack = encode_nack(8, 100, 0, "unknown pane");
        let value: Value = serde_json::from_slice(&nack).unwrap();
        assert_eq!(value["type"], "nack");
        assert_eq!(value["args"]["ref"], 0);
        assert_eq!(value["args"]["desc"], "unknown pane");
    }

    #[test]
    fn line_buffer_reassembles_split_frames() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"a\":").is_empty());
        let lines = buffer.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        let lines = buffer.push(b":3}\r\n");
        assert_eq!(lines, vec!["{\"c\":3}".to_string()]);
    }
}
