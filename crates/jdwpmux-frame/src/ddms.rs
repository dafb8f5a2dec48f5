//! DDMS chunk payloads.
//!
//! Integers are big-endian. Strings are an `i32` count of UTF-16 code units
//! followed by the UTF-16BE data, except inside HELO where the two lengths
//! precede both strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::{Chunk, ChunkType};
use crate::error::{FrameError, Result};

/// Protocol version the host announces in its HELO request.
pub const HOST_PROTOCOL_VERSION: i32 = 1;

/// Reason byte of a WAIT chunk meaning "waiting for a debugger".
pub const WAIT_FOR_DEBUGGER: u8 = 0;

/// Reply to a HELO request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeloReply {
    pub protocol_version: i32,
    pub pid: i32,
    pub vm_identifier: String,
    pub process_name: String,
    pub user_id: Option<i32>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub is_native_debuggable: Option<bool>,
    pub package_name: Option<String>,
}

/// Application name change event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApnmEvent {
    pub process_name: String,
    pub user_id: Option<i32>,
    pub package_name: Option<String>,
}

/// WAIT event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEvent {
    pub reason: u8,
}

/// FAIL reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailReply {
    pub error_code: i32,
    pub message: String,
}

struct ChunkCursor {
    chunk: ChunkType,
    src: Bytes,
}

impl ChunkCursor {
    fn new(chunk: &Chunk) -> Self {
        Self {
            chunk: chunk.chunk_type,
            src: chunk.payload.clone(),
        }
    }

    fn has_remaining(&self) -> bool {
        self.src.has_remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.src.remaining() < n {
            return Err(FrameError::malformed(
                self.chunk,
                format!("{what}: need {n} bytes, {} left", self.src.remaining()),
            ));
        }
        Ok(())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.src.get_i32())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.src.get_u8())
    }

    fn length(&mut self, what: &str) -> Result<usize> {
        let len = self.i32(what)?;
        usize::try_from(len)
            .map_err(|_| FrameError::malformed(self.chunk, format!("{what}: negative length {len}")))
    }

    fn utf16(&mut self, units: usize, what: &str) -> Result<String> {
        self.need(units * 2, what)?;
        let data: Vec<u16> = (0..units).map(|_| self.src.get_u16()).collect();
        String::from_utf16(&data)
            .map_err(|_| FrameError::malformed(self.chunk, format!("{what}: invalid UTF-16")))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let units = self.length(what)?;
        self.utf16(units, what)
    }
}

/// Append a length-prefixed UTF-16BE string.
pub fn put_string(dst: &mut BytesMut, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    dst.put_i32(units.len() as i32);
    for unit in units {
        dst.put_u16(unit);
    }
}

fn put_utf16(dst: &mut BytesMut, value: &str) {
    for unit in value.encode_utf16() {
        dst.put_u16(unit);
    }
}

fn expect_type(chunk: &Chunk, expected: ChunkType) -> Result<()> {
    if chunk.chunk_type != expected {
        return Err(FrameError::malformed(
            chunk.chunk_type,
            format!("expected {expected} chunk"),
        ));
    }
    Ok(())
}

impl HeloReply {
    pub fn parse(chunk: &Chunk) -> Result<Self> {
        expect_type(chunk, ChunkType::Helo)?;
        let mut c = ChunkCursor::new(chunk);
        let protocol_version = c.i32("version")?;
        let pid = c.i32("pid")?;
        let vm_ident_len = c.length("vm identifier length")?;
        let app_name_len = c.length("app name length")?;
        let vm_identifier = c.utf16(vm_ident_len, "vm identifier")?;
        let process_name = c.utf16(app_name_len, "app name")?;
        let mut reply = Self {
            protocol_version,
            pid,
            vm_identifier,
            process_name,
            ..Self::default()
        };
        if c.has_remaining() {
            reply.user_id = Some(c.i32("user id")?);
        }
        if c.has_remaining() {
            reply.abi = Some(c.string("abi")?);
        }
        if c.has_remaining() {
            reply.jvm_flags = Some(c.string("jvm flags")?);
        }
        if c.has_remaining() {
            reply.is_native_debuggable = Some(c.u8("native debuggable")? != 0);
        }
        if c.has_remaining() {
            reply.package_name = Some(c.string("package name")?);
        }
        Ok(reply)
    }

    /// Encode as sent by a VM. Optional fields are written up to the first
    /// one that is unset.
    pub fn to_chunk(&self) -> Chunk {
        let mut buf = BytesMut::new();
        buf.put_i32(self.protocol_version);
        buf.put_i32(self.pid);
        buf.put_i32(self.vm_identifier.encode_utf16().count() as i32);
        buf.put_i32(self.process_name.encode_utf16().count() as i32);
        put_utf16(&mut buf, &self.vm_identifier);
        put_utf16(&mut buf, &self.process_name);
        if let Some(user_id) = self.user_id {
            buf.put_i32(user_id);
            if let Some(abi) = &self.abi {
                put_string(&mut buf, abi);
                if let Some(flags) = &self.jvm_flags {
                    put_string(&mut buf, flags);
                    if let Some(native) = self.is_native_debuggable {
                        buf.put_u8(u8::from(native));
                        if let Some(package) = &self.package_name {
                            put_string(&mut buf, package);
                        }
                    }
                }
            }
        }
        Chunk::new(ChunkType::Helo, buf.freeze())
    }
}

impl ApnmEvent {
    pub fn parse(chunk: &Chunk) -> Result<Self> {
        expect_type(chunk, ChunkType::Apnm)?;
        let mut c = ChunkCursor::new(chunk);
        let mut event = Self {
            process_name: c.string("app name")?,
            ..Self::default()
        };
        if c.has_remaining() {
            event.user_id = Some(c.i32("user id")?);
        }
        if c.has_remaining() {
            event.package_name = Some(c.string("package name")?);
        }
        Ok(event)
    }

    pub fn to_chunk(&self) -> Chunk {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.process_name);
        if let Some(user_id) = self.user_id {
            buf.put_i32(user_id);
            if let Some(package) = &self.package_name {
                put_string(&mut buf, package);
            }
        }
        Chunk::new(ChunkType::Apnm, buf.freeze())
    }
}

/// Parse a FEAT reply into its feature list.
pub fn parse_features(chunk: &Chunk) -> Result<Vec<String>> {
    expect_type(chunk, ChunkType::Feat)?;
    let mut c = ChunkCursor::new(chunk);
    let count = c.length("feature count")?;
    (0..count).map(|_| c.string("feature")).collect()
}

/// Encode a FEAT reply.
pub fn features_chunk<S: AsRef<str>>(features: &[S]) -> Chunk {
    let mut buf = BytesMut::new();
    buf.put_i32(features.len() as i32);
    for feature in features {
        put_string(&mut buf, feature.as_ref());
    }
    Chunk::new(ChunkType::Feat, buf.freeze())
}

impl WaitEvent {
    pub fn parse(chunk: &Chunk) -> Result<Self> {
        expect_type(chunk, ChunkType::Wait)?;
        let mut c = ChunkCursor::new(chunk);
        Ok(Self {
            reason: c.u8("reason")?,
        })
    }

    pub fn is_waiting_for_debugger(&self) -> bool {
        self.reason == WAIT_FOR_DEBUGGER
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(ChunkType::Wait, vec![self.reason])
    }
}

impl FailReply {
    pub fn parse(chunk: &Chunk) -> Result<Self> {
        expect_type(chunk, ChunkType::Fail)?;
        let mut c = ChunkCursor::new(chunk);
        Ok(Self {
            error_code: c.i32("error code")?,
            message: c.string("message")?,
        })
    }

    pub fn to_chunk(&self) -> Chunk {
        let mut buf = BytesMut::new();
        buf.put_i32(self.error_code);
        put_string(&mut buf, &self.message);
        Chunk::new(ChunkType::Fail, buf.freeze())
    }
}

/// Parse a one-byte status reply (REAQ, MPRQ).
pub fn parse_status_byte(chunk: &Chunk) -> Result<u8> {
    ChunkCursor::new(chunk).u8("status")
}

/// HELO request announcing the host protocol version.
pub fn helo_request() -> Chunk {
    Chunk::new(ChunkType::Helo, HOST_PROTOCOL_VERSION.to_be_bytes().to_vec())
}

/// FEAT request.
pub fn feat_request() -> Chunk {
    Chunk::new(ChunkType::Feat, Bytes::new())
}

/// EXIT request with the given status code.
pub fn exit_request(status: i32) -> Chunk {
    Chunk::new(ChunkType::Exit, status.to_be_bytes().to_vec())
}

/// REAE request enabling or disabling allocation tracking.
pub fn reae_request(enabled: bool) -> Chunk {
    Chunk::new(ChunkType::Reae, vec![u8::from(enabled)])
}

/// MPSS request: start streaming method profiling.
pub fn mpss_request(buffer_size: i32, flags: i32) -> Chunk {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(buffer_size);
    buf.put_i32(flags);
    Chunk::new(ChunkType::Mpss, buf.freeze())
}

/// SPSS request: start sampling profiling.
pub fn spss_request(buffer_size: i32, flags: i32, interval_us: i32) -> Chunk {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_i32(buffer_size);
    buf.put_i32(flags);
    buf.put_i32(interval_us);
    Chunk::new(ChunkType::Spss, buf.freeze())
}
