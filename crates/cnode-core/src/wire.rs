//! cnode wire format — the commands nodes exchange over the transport.
//!
//! A command is a single CBOR map with text keys. The key set, the integer
//! values of `CommandKind` and the signature characters ARE the protocol:
//! controllers on other platforms encode and decode the same bytes, so
//! nothing here may change without changing every peer.
//!
//! Limits are enforced on both sides. An oversized or malformed buffer is
//! rejected whole; there is no partial parse.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use ciborium::value::{Integer, Value};

// ── Limits ────────────────────────────────────────────────────────────────────

/// Maximum function name length in bytes.
pub const MAX_FN_NAME_LEN: usize = 32;

/// Maximum node id length in bytes.
pub const MAX_NODE_ID_LEN: usize = 128;

/// Maximum argument signature length: one character per argument.
pub const MAX_ARGSIG_LEN: usize = 32;

/// Maximum size of an encoded command.
pub const MAX_COMMAND_LEN: usize = 1024;

// ── Map keys ──────────────────────────────────────────────────────────────────

const KEY_CMD: &str = "cmd";
const KEY_SUBCMD: &str = "subcmd";
const KEY_FN_NAME: &str = "fn_name";
const KEY_TASK_ID: &str = "task_id";
const KEY_NODE_ID: &str = "node_id";
const KEY_FN_ARGSIG: &str = "fn_argsig";
const KEY_ARGS: &str = "args";

// ── Argument types ────────────────────────────────────────────────────────────

/// Type tag carried by every `Argument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Null,
    String,
    Int32,
    Int64,
    Float64,
    Blob,
    Void,
}

impl ArgType {
    /// Parse one signature character.
    pub fn from_sig_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Int32),
            'l' => Some(Self::Int64),
            'f' => Some(Self::Float64),
            's' => Some(Self::String),
            'n' => Some(Self::Blob),
            _ => None,
        }
    }

    /// Signature character for this type. Null and Void have none; they
    /// never travel as arguments.
    pub fn sig_char(self) -> Option<char> {
        match self {
            Self::Int32 => Some('i'),
            Self::Int64 => Some('l'),
            Self::Float64 => Some('f'),
            Self::String => Some('s'),
            Self::Blob => Some('n'),
            Self::Null | Self::Void => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String => "string",
            Self::Int32 => "int",
            Self::Int64 => "long",
            Self::Float64 => "double",
            Self::Blob => "blob",
            Self::Void => "void",
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Arguments ─────────────────────────────────────────────────────────────────

/// A tagged value: a function parameter or a function's return value.
///
/// String and Blob own their storage; cloning an argument list deep-copies it.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Null,
    String(String),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Blob(Vec<u8>),
    Void,
}

impl Argument {
    pub fn arg_type(&self) -> ArgType {
        match self {
            Self::Null => ArgType::Null,
            Self::String(_) => ArgType::String,
            Self::Int32(_) => ArgType::Int32,
            Self::Int64(_) => ArgType::Int64,
            Self::Float64(_) => ArgType::Float64,
            Self::Blob(_) => ArgType::Blob,
            Self::Void => ArgType::Void,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// CBOR form. Null and Void have no wire form.
    fn to_cbor(&self) -> Option<Value> {
        match self {
            Self::String(s) => Some(Value::Text(s.clone())),
            Self::Int32(v) => Some(Value::Integer(Integer::from(*v))),
            Self::Int64(v) => Some(Value::Integer(Integer::from(*v))),
            Self::Float64(v) => Some(Value::Float(*v)),
            Self::Blob(b) => Some(Value::Bytes(b.clone())),
            Self::Null | Self::Void => None,
        }
    }

    /// Read a CBOR value as the type the signature says it is.
    fn from_cbor(index: usize, expected: ArgType, value: Value) -> Result<Self, WireError> {
        let mismatch = || WireError::ArgTypeMismatch { index, expected };
        match (expected, value) {
            (ArgType::Int32, Value::Integer(i)) => {
                i32::try_from(i).map(Self::Int32).map_err(|_| mismatch())
            }
            (ArgType::Int64, Value::Integer(i)) => {
                i64::try_from(i).map(Self::Int64).map_err(|_| mismatch())
            }
            (ArgType::Float64, Value::Float(f)) => Ok(Self::Float64(f)),
            (ArgType::String, Value::Text(s)) => Ok(Self::String(s)),
            (ArgType::Blob, Value::Bytes(b)) => Ok(Self::Blob(b)),
            _ => Err(mismatch()),
        }
    }
}

impl From<i32> for Argument {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Argument {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Argument {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Argument {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Argument {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

// ── Signature ─────────────────────────────────────────────────────────────────

/// Ordered parameter types, written compactly as one character per argument:
/// `"iis"` is (int, int, string).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature(Vec<ArgType>);

impl Signature {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse the compact form.
    pub fn parse(sig: &str) -> Result<Self, WireError> {
        if sig.len() > MAX_ARGSIG_LEN {
            return Err(WireError::FieldTooLong {
                field: KEY_FN_ARGSIG,
                len: sig.len(),
                max: MAX_ARGSIG_LEN,
            });
        }
        sig.chars()
            .map(|c| ArgType::from_sig_char(c).ok_or(WireError::UnknownSigChar(c)))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Signature describing an argument list.
    pub fn of(args: &[Argument]) -> Result<Self, WireError> {
        if args.len() > MAX_ARGSIG_LEN {
            return Err(WireError::FieldTooLong {
                field: KEY_FN_ARGSIG,
                len: args.len(),
                max: MAX_ARGSIG_LEN,
            });
        }
        args.iter()
            .map(|a| {
                let ty = a.arg_type();
                ty.sig_char().map(|_| ty).ok_or(WireError::UnsignedArgument(ty))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn types(&self) -> &[ArgType] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check arity and every type tag against an argument list.
    pub fn check(&self, args: &[Argument]) -> Result<(), WireError> {
        if args.len() != self.0.len() {
            return Err(WireError::ArityMismatch {
                expected: self.0.len(),
                actual: args.len(),
            });
        }
        for (index, (expected, arg)) in self.0.iter().zip(args).enumerate() {
            if arg.arg_type() != *expected {
                return Err(WireError::ArgTypeMismatch {
                    index,
                    expected: *expected,
                });
            }
        }
        Ok(())
    }

    pub fn matches(&self, args: &[Argument]) -> bool {
        self.check(args).is_ok()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.0 {
            if let Some(c) = ty.sig_char() {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Command kinds ─────────────────────────────────────────────────────────────

/// Protocol command kind. Integer values follow the protocol enumeration.
///
/// Unknown integers decode to `Other` rather than failing, so the receiver
/// can still answer them with `RexecErr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Register,
    RegisterAck,
    NewRegister,
    OldRegister,
    Ping,
    Rexec,
    RexecAck,
    ClosePort,
    GetRexecRes,
    RexecRes,
    RexecErr,
    Other(u32),
}

impl CommandKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::RegisterAck => "REGISTER_ACK",
            Self::NewRegister => "NEW_REGISTER",
            Self::OldRegister => "OLD_REGISTER",
            Self::Ping => "PING",
            Self::Rexec => "REXEC",
            Self::RexecAck => "REXEC_ACK",
            Self::ClosePort => "CLOSE_PORT",
            Self::GetRexecRes => "GET_REXEC_RES",
            Self::RexecRes => "REXEC_RES",
            Self::RexecErr => "REXEC_ERR",
            Self::Other(_) => "UNKNOWN",
        }
    }

    /// Session/discovery commands handled outside the execution protocol.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Register
                | Self::RegisterAck
                | Self::NewRegister
                | Self::OldRegister
                | Self::Ping
                | Self::ClosePort
        )
    }
}

impl From<u32> for CommandKind {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Register,
            1 => Self::RegisterAck,
            2 => Self::NewRegister,
            3 => Self::OldRegister,
            4 => Self::Ping,
            5 => Self::Rexec,
            6 => Self::RexecAck,
            7 => Self::ClosePort,
            8 => Self::GetRexecRes,
            9 => Self::RexecRes,
            10 => Self::RexecErr,
            other => Self::Other(other),
        }
    }
}

impl From<CommandKind> for u32 {
    fn from(kind: CommandKind) -> u32 {
        match kind {
            CommandKind::Register => 0,
            CommandKind::RegisterAck => 1,
            CommandKind::NewRegister => 2,
            CommandKind::OldRegister => 3,
            CommandKind::Ping => 4,
            CommandKind::Rexec => 5,
            CommandKind::RexecAck => 6,
            CommandKind::ClosePort => 7,
            CommandKind::GetRexecRes => 8,
            CommandKind::RexecRes => 9,
            CommandKind::RexecErr => 10,
            CommandKind::Other(n) => n,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(n) => write!(f, "UNKNOWN({n})"),
            kind => f.write_str(kind.name()),
        }
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// A protocol message together with its encoded bytes.
///
/// Immutable once built or decoded. Equality compares protocol fields only;
/// two commands with different byte layouts but the same fields are equal.
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    subcommand: i32,
    fn_name: String,
    task_id: u64,
    node_id: String,
    signature: Signature,
    args: Vec<Argument>,
    encoded: Bytes,
}

impl Command {
    /// Build and encode a command. The signature is derived from `args`.
    pub fn new(
        kind: CommandKind,
        subcommand: i32,
        fn_name: impl Into<String>,
        task_id: u64,
        node_id: impl Into<String>,
        args: Vec<Argument>,
    ) -> Result<Self, WireError> {
        let fn_name = fn_name.into();
        let node_id = node_id.into();
        check_len(KEY_FN_NAME, &fn_name, MAX_FN_NAME_LEN)?;
        check_len(KEY_NODE_ID, &node_id, MAX_NODE_ID_LEN)?;
        let signature = Signature::of(&args)?;

        let encoded = encode(kind, subcommand, &fn_name, task_id, &node_id, &signature, &args)?;
        Ok(Self {
            kind,
            subcommand,
            fn_name,
            task_id,
            node_id,
            signature,
            args,
            encoded,
        })
    }

    /// Build a reply to `trigger`, copying the correlation fields
    /// (subcommand, function name, task id, node id).
    ///
    /// A Null or Void payload travels as an empty argument list.
    pub fn reply(
        kind: CommandKind,
        trigger: &Command,
        payload: Option<Argument>,
    ) -> Result<Self, WireError> {
        let args = payload
            .filter(|a| a.arg_type().sig_char().is_some())
            .into_iter()
            .collect();
        Self::new(
            kind,
            trigger.subcommand,
            trigger.fn_name.clone(),
            trigger.task_id,
            trigger.node_id.clone(),
            args,
        )
    }

    /// Decode a received buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Empty);
        }
        if buf.len() > MAX_COMMAND_LEN {
            return Err(WireError::TooLarge(buf.len()));
        }

        let value: Value =
            ciborium::de::from_reader(buf).map_err(|e| WireError::Malformed(format!("{e:?}")))?;
        let mut entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(WireError::NotAMap),
        };

        let kind = match take(&mut entries, KEY_CMD)? {
            Value::Integer(i) => {
                CommandKind::from(u32::try_from(i).map_err(|_| WireError::InvalidField(KEY_CMD))?)
            }
            _ => return Err(WireError::InvalidField(KEY_CMD)),
        };
        let subcommand = match take(&mut entries, KEY_SUBCMD)? {
            Value::Integer(i) => {
                i32::try_from(i).map_err(|_| WireError::InvalidField(KEY_SUBCMD))?
            }
            _ => return Err(WireError::InvalidField(KEY_SUBCMD)),
        };
        let fn_name = take_text(&mut entries, KEY_FN_NAME, MAX_FN_NAME_LEN)?;
        let task_id = match take(&mut entries, KEY_TASK_ID)? {
            Value::Integer(i) => {
                u64::try_from(i).map_err(|_| WireError::InvalidField(KEY_TASK_ID))?
            }
            _ => return Err(WireError::InvalidField(KEY_TASK_ID)),
        };
        let node_id = take_text(&mut entries, KEY_NODE_ID, MAX_NODE_ID_LEN)?;
        let signature = Signature::parse(&take_text(&mut entries, KEY_FN_ARGSIG, MAX_ARGSIG_LEN)?)?;

        let raw_args = match take(&mut entries, KEY_ARGS)? {
            Value::Array(items) => items,
            _ => return Err(WireError::InvalidField(KEY_ARGS)),
        };
        if raw_args.len() != signature.len() {
            return Err(WireError::ArityMismatch {
                expected: signature.len(),
                actual: raw_args.len(),
            });
        }
        let args = signature
            .types()
            .iter()
            .zip(raw_args)
            .enumerate()
            .map(|(index, (ty, value))| Argument::from_cbor(index, *ty, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            kind,
            subcommand,
            fn_name,
            task_id,
            node_id,
            signature,
            args,
            encoded: Bytes::copy_from_slice(buf),
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn subcommand(&self) -> i32 {
        self.subcommand
    }

    pub fn fn_name(&self) -> &str {
        &self.fn_name
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Encoded form, as received or as built.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Cheap clone of the encoded form for handing to a transport.
    pub fn to_bytes(&self) -> Bytes {
        self.encoded.clone()
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.subcommand == other.subcommand
            && self.fn_name == other.fn_name
            && self.task_id == other.task_id
            && self.node_id == other.node_id
            && self.signature == other.signature
            && self.args == other.args
    }
}

// ── Codec helpers ─────────────────────────────────────────────────────────────

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), WireError> {
    if value.len() > max {
        return Err(WireError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn encode(
    kind: CommandKind,
    subcommand: i32,
    fn_name: &str,
    task_id: u64,
    node_id: &str,
    signature: &Signature,
    args: &[Argument],
) -> Result<Bytes, WireError> {
    let fields = [
        (KEY_CMD, Value::Integer(Integer::from(u32::from(kind)))),
        (KEY_SUBCMD, Value::Integer(Integer::from(subcommand))),
        (KEY_FN_NAME, text(fn_name)),
        (KEY_TASK_ID, Value::Integer(Integer::from(task_id))),
        (KEY_NODE_ID, text(node_id)),
        (KEY_FN_ARGSIG, Value::Text(signature.to_string())),
    ];
    let items: Vec<Value> = args.iter().filter_map(Argument::to_cbor).collect();

    let mut buf = Vec::with_capacity(128);
    write_head(&mut buf, MAJOR_MAP, fields.len() + 1);
    for (key, value) in &fields {
        write_value(&mut buf, &text(key))?;
        write_value(&mut buf, value)?;
    }
    write_value(&mut buf, &text(KEY_ARGS))?;
    write_head(&mut buf, MAJOR_ARRAY, items.len());
    for item in &items {
        match item {
            // Always a full double; peers read `f` as float64.
            Value::Float(v) => {
                buf.push(FLOAT64_HEAD);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            other => write_value(&mut buf, other)?,
        }
    }

    if buf.len() > MAX_COMMAND_LEN {
        return Err(WireError::TooLarge(buf.len()));
    }
    Ok(Bytes::from(buf))
}

const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const FLOAT64_HEAD: u8 = 0xfb;

/// Definite-length item header.
fn write_head(buf: &mut Vec<u8>, major: u8, len: usize) {
    let major = major << 5;
    match len {
        0..=23 => buf.push(major | len as u8),
        24..=0xff => buf.extend_from_slice(&[major | 24, len as u8]),
        0x100..=0xffff => {
            buf.push(major | 25);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(major | 26);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), WireError> {
    ciborium::ser::into_writer(value, &mut *buf).map_err(|e| WireError::Encode(format!("{e:?}")))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Remove and return the value stored under `key`.
fn take(entries: &mut Vec<(Value, Value)>, key: &'static str) -> Result<Value, WireError> {
    let pos = entries
        .iter()
        .position(|(k, _)| matches!(k, Value::Text(t) if t == key))
        .ok_or(WireError::MissingField(key))?;
    Ok(entries.swap_remove(pos).1)
}

fn take_text(
    entries: &mut Vec<(Value, Value)>,
    key: &'static str,
    max: usize,
) -> Result<String, WireError> {
    match take(entries, key)? {
        Value::Text(s) => {
            check_len(key, &s, max)?;
            Ok(s)
        }
        _ => Err(WireError::InvalidField(key)),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting a command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("empty command buffer")]
    Empty,

    #[error("command length {0} exceeds maximum {}", MAX_COMMAND_LEN)]
    TooLarge(usize),

    #[error("malformed CBOR: {0}")]
    Malformed(String),

    #[error("command is not a CBOR map")]
    NotAMap,

    #[error("missing field \"{0}\"")]
    MissingField(&'static str),

    #[error("field \"{0}\" has the wrong type or is out of range")]
    InvalidField(&'static str),

    #[error("field \"{field}\" is {len} bytes, maximum {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("unknown signature character '{0}'")]
    UnknownSigChar(char),

    #[error("{0} values cannot be passed as arguments")]
    UnsignedArgument(ArgType),

    #[error("signature expects {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("argument {index} is not a {expected}")]
    ArgTypeMismatch { index: usize, expected: ArgType },

    #[error("failed to encode command: {0}")]
    Encode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
