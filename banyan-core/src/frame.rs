//! An RFC 6455 frame and its incremental parser.
//!
//! The parser is fed whatever slice the socket produced and reports how
//! far it got: a frame may arrive one byte at a time or several frames may
//! share a single read. [`Frame::parse`] returns the bytes it consumed so
//! the caller can hand the tail to the next frame.

// ----------

use bytes::{BufMut, Bytes, BytesMut};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

// Control frames must fit in a 7-bit length per RFC 6455 §5.5.
const MAX_CONTROL_PAYLOAD_SIZE: u64 = 125;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;

// 2 fixed bytes + 8 extended-length bytes + 4 masking-key bytes.
const MAX_HEADER_SIZE: usize = 14;

// --------------------------------------------------
// OpCode

/// A frame opcode. Data opcodes carry application payload; control
/// opcodes drive the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
	Continuation,
	Text,
	Binary,
	ConnectionClose,
	Ping,
	Pong,
}

impl OpCode {
	fn from_bits(bits: u8) -> Option<Self> {
		match bits {
			0x0 => Some(OpCode::Continuation),
			0x1 => Some(OpCode::Text),
			0x2 => Some(OpCode::Binary),
			0x8 => Some(OpCode::ConnectionClose),
			0x9 => Some(OpCode::Ping),
			0xA => Some(OpCode::Pong),
			_ => None,
		}
	}

	fn bits(self) -> u8 {
		match self {
			OpCode::Continuation => 0x0,
			OpCode::Text => 0x1,
			OpCode::Binary => 0x2,
			OpCode::ConnectionClose => 0x8,
			OpCode::Ping => 0x9,
			OpCode::Pong => 0xA,
		}
	}

	#[inline(always)]
	pub fn is_control(self) -> bool {
		matches!(self, OpCode::ConnectionClose | OpCode::Ping | OpCode::Pong)
	}
}

// --------------------------------------------------
// FrameParseStatus

/// Where the parser stands after the last fed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseStatus {
	/// Still collecting header bytes.
	Prepare,
	/// Header decoded; collecting payload bytes.
	Parsing,
	/// The frame is complete and its payload is unmasked.
	Completed,
	/// The frame is malformed; the connection is unrecoverable.
	Error,
}

// --------------------------------------------------
// FrameError

/// The reason a frame was rejected.
#[derive(Debug, crate::ImplError)]
pub enum FrameError {
	#[error("invalid opcode {0:#x}")]
	InvalidOpCode(u8),
	#[error("fragmented control frame")]
	FragmentedControlFrame,
	#[error("control frame payload of {0} bytes")]
	ControlPayloadTooLarge(u64),
	#[error("payload of {0} bytes exceeds the frame size limit")]
	PayloadTooLarge(u64),
}

// --------------------------------------------------
// Frame

/// A single frame being accumulated from the stream.
#[derive(Debug)]
pub struct Frame {
	header: Vec<u8>,
	fin: bool,
	opcode: OpCode,
	masked: bool,
	masking_key: [u8; 4],
	payload_length: u64,
	payload: BytesMut,
	status: FrameParseStatus,
	some_error: Option<FrameError>,
}

impl Frame {
	pub fn new() -> Self {
		Self {
			header: Vec::with_capacity(MAX_HEADER_SIZE),
			fin: false,
			opcode: OpCode::Continuation,
			masked: false,
			masking_key: [0; 4],
			payload_length: 0,
			payload: BytesMut::new(),
			status: FrameParseStatus::Prepare,
			some_error: None,
		}
	}

	#[inline(always)]
	pub fn status(&self) -> FrameParseStatus {
		self.status
	}

	/// Valid once the header has been decoded (`Parsing` onwards).
	#[inline(always)]
	pub fn opcode(&self) -> OpCode {
		self.opcode
	}

	#[inline(always)]
	pub fn fin(&self) -> bool {
		self.fin
	}

	#[inline(always)]
	pub fn payload(&self) -> &[u8] {
		&self.payload
	}

	pub fn error(&self) -> Option<&FrameError> {
		self.some_error.as_ref()
	}

	/// Feeds the next chunk of stream bytes into the frame.
	///
	/// Returns the resulting status and how many bytes of `input` were
	/// consumed. Anything past the consumed count belongs to the next
	/// frame. A `Completed` or `Error` frame consumes nothing further.
	pub fn parse(&mut self, input: &[u8]) -> (FrameParseStatus, usize) {
		let mut consumed = 0;

		if self.status == FrameParseStatus::Prepare {
			while self.header.len() < 2 && consumed < input.len() {
				self.header.push(input[consumed]);
				consumed += 1;
			}

			if self.header.len() < 2 {
				return (self.status, consumed);
			}

			let header_size = Self::header_size(self.header[1]);
			while self.header.len() < header_size && consumed < input.len() {
				self.header.push(input[consumed]);
				consumed += 1;
			}

			if self.header.len() < header_size {
				return (self.status, consumed);
			}

			if let Err(error) = self.decode_header() {
				self.some_error = Some(error);
				self.status = FrameParseStatus::Error;

				return (self.status, consumed);
			}

			self.payload.reserve(self.payload_length as usize);
			self.status = FrameParseStatus::Parsing;
		}

		if self.status == FrameParseStatus::Parsing {
			let remaining = self.payload_length as usize - self.payload.len();
			let take = remaining.min(input.len() - consumed);
			self.payload.extend_from_slice(&input[consumed..consumed + take]);
			consumed += take;

			if self.payload.len() as u64 == self.payload_length {
				if self.masked {
					for (index, byte) in self.payload.iter_mut().enumerate() {
						*byte ^= self.masking_key[index % 4];
					}
				}

				self.status = FrameParseStatus::Completed;
			}
		}

		(self.status, consumed)
	}

	// The second fixed byte alone determines how long the header is.
	fn header_size(second: u8) -> usize {
		let extended = match second & !MASK_BIT {
			126 => 2,
			127 => 8,
			_ => 0,
		};

		let masking = if second & MASK_BIT != 0 { 4 } else { 0 };

		2 + extended + masking
	}

	fn decode_header(&mut self) -> Result<(), FrameError> {
		let first = self.header[0];
		let second = self.header[1];

		self.fin = first & FIN_BIT != 0;
		self.opcode =
			OpCode::from_bits(first & OPCODE_MASK).ok_or(FrameError::InvalidOpCode(first & OPCODE_MASK))?;
		self.masked = second & MASK_BIT != 0;

		let length_bits = second & !MASK_BIT;
		let key_offset = match length_bits {
			126 => {
				self.payload_length =
					u16::from_be_bytes([self.header[2], self.header[3]]) as u64;

				4
			}
			127 => {
				self.payload_length = u64::from_be_bytes(
					self.header[2..10]
						.try_into()
						.expect("an 8-byte slice of a complete header"),
				);

				10
			}
			length => {
				self.payload_length = length as u64;

				2
			}
		};

		if self.masked {
			self.masking_key
				.copy_from_slice(&self.header[key_offset..key_offset + 4]);
		}

		if self.opcode.is_control() {
			if !self.fin {
				return Err(FrameError::FragmentedControlFrame);
			}

			if self.payload_length > MAX_CONTROL_PAYLOAD_SIZE {
				return Err(FrameError::ControlPayloadTooLarge(self.payload_length));
			}
		}

		if self.payload_length > MAX_PAYLOAD_SIZE {
			return Err(FrameError::PayloadTooLarge(self.payload_length));
		}

		Ok(())
	}

	/// Encodes a single unmasked frame with the FIN bit set, the way a
	/// server speaks to a client.
	pub fn encode(opcode: OpCode, payload: &[u8]) -> Bytes {
		let mut buffer = BytesMut::with_capacity(payload.len() + 10);
		buffer.put_u8(FIN_BIT | opcode.bits());

		let length = payload.len();
		if length < 126 {
			buffer.put_u8(length as u8);
		} else if length <= u16::MAX as usize {
			buffer.put_u8(126);
			buffer.put_u16(length as u16);
		} else {
			buffer.put_u8(127);
			buffer.put_u64(length as u64);
		}

		buffer.extend_from_slice(payload);
		buffer.freeze()
	}
}

impl Default for Frame {
	fn default() -> Self {
		Self::new()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
