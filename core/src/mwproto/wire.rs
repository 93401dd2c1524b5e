//! Binary framing and field-level (de)serialization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Message;

pub const HEADER_SIZE: usize = 24;
const LENGTH_FIELD_SIZE: usize = 4;
const MIN_MESSAGE_SIZE: u32 = HEADER_SIZE as u32;
const MAX_MESSAGE_SIZE: u32 = 1 << 24;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("read message: {0}")]
    Io(#[from] std::io::Error),
    #[error("read message: length out of bounds: {got}")]
    LengthOutOfBounds { got: u32 },
    #[error("read message: unknown message type: {0}")]
    UnknownType(u32),
    #[error("message payload ended early")]
    ShortPayload,
    #[error("unterminated string value length")]
    UnterminatedVarint,
    #[error("string value length {length} exceeds message payload; remaining payload is {remaining} bytes long")]
    StringTooLong { length: i32, remaining: usize },
    #[error("string value length out of int32 range")]
    VarintOutOfRange,
    #[error("json field: {0}")]
    Json(#[from] serde_json::Error),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

impl WireError {
    /// Errors that end the connection, as opposed to per-frame failures the
    /// reader recovers from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::Io(_))
    }
}

/// Reads one framed message. A frame whose length field is out of bounds is
/// drained (`len - 4` bytes) so the stream stays aligned for the next frame.
pub async fn read_message<R>(r: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; LENGTH_FIELD_SIZE];
    r.read_exact(&mut length_buf).await?;
    let length = u32::from_le_bytes(length_buf);
    if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        let to_drain = u64::from(length).saturating_sub(LENGTH_FIELD_SIZE as u64);
        let mut limited = (&mut *r).take(to_drain);
        let _ = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await;
        return Err(WireError::LengthOutOfBounds { got: length });
    }

    let mut frame = vec![0u8; length as usize - LENGTH_FIELD_SIZE];
    r.read_exact(&mut frame).await?;
    let type_code = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    // sender_uid and message_id are ignored.
    let payload = &frame[HEADER_SIZE - LENGTH_FIELD_SIZE..];
    decode_payload(type_code, payload)
}

/// Writes one framed message, zeroing `sender_uid` and `message_id`.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg)?;
    w.write_all(&frame).await?;
    Ok(())
}

/// Encodes a full frame, header included.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut w = FieldWriter::new();
    encode_payload(msg, &mut w)?;
    let mut frame = w.buf;
    let len = frame.len() as u32;
    frame[0..4].copy_from_slice(&len.to_le_bytes());
    frame[4..8].copy_from_slice(&msg.type_code().to_le_bytes());
    Ok(frame)
}

struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    fn new() -> Self {
        FieldWriter {
            buf: vec![0u8; HEADER_SIZE],
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.varint(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn json<T: Serialize>(&mut self, v: &T) -> Result<(), WireError> {
        let raw = serde_json::to_vec(v)?;
        self.varint(raw.len() as i32);
        self.buf.extend_from_slice(&raw);
        Ok(())
    }

    // The 7-bit little-endian varint used for string lengths; see the .NET
    // BinaryWriter.Write7BitEncodedInt format.
    fn varint(&mut self, v: i32) {
        let mut u = v as u32;
        loop {
            let b = (u & 0x7f) as u8;
            u >>= 7;
            if u == 0 {
                self.buf.push(b);
                return;
            }
            self.buf.push(b | 0x80);
        }
    }
}

struct FieldReader<'a> {
    payload: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        FieldReader { payload }
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        let (&b, rest) = self.payload.split_first().ok_or(WireError::ShortPayload)?;
        self.payload = rest;
        Ok(b)
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        if self.payload.len() < 4 {
            return Err(WireError::ShortPayload);
        }
        let (head, rest) = self.payload.split_at(4);
        self.payload = rest;
        Ok(i32::from_le_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let mut length: i64 = 0;
        for (i, &b) in self.payload.iter().enumerate() {
            if i >= 5 {
                return Err(WireError::VarintOutOfRange);
            }
            length |= i64::from(b & 0x7f) << (i * 7);
            if b & 0x80 != 0 {
                continue;
            }
            if length < 0 || length > i64::from(i32::MAX) {
                return Err(WireError::VarintOutOfRange);
            }
            let start = i + 1;
            let end = start + length as usize;
            if end > self.payload.len() {
                return Err(WireError::StringTooLong {
                    length: length as i32,
                    remaining: self.payload.len(),
                });
            }
            let raw = &self.payload[start..end];
            self.payload = &self.payload[end..];
            return Ok(raw);
        }
        Err(WireError::UnterminatedVarint)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn json<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        let raw = self.bytes()?;
        Ok(serde_json::from_slice(raw)?)
    }
}

fn encode_payload(msg: &Message, w: &mut FieldWriter) -> Result<(), WireError> {
    match msg {
        Message::Connect { server_name } => w.string(server_name),
        Message::Disconnect => {}
        Message::Join {
            display_name,
            player_id,
            rando_id,
        } => {
            w.string(display_name);
            w.i32(*player_id);
            w.i32(*rando_id);
        }
        Message::JoinConfirm => {}
        Message::DataReceive {
            label,
            content,
            from,
            from_id,
        } => {
            w.string(label);
            w.string(content);
            w.string(from);
            w.i32(*from_id);
        }
        Message::DataReceiveConfirm { label, data, from } => {
            w.string(label);
            w.string(data);
            w.string(from);
        }
        Message::DataSend {
            label,
            content,
            to,
            ttl,
        } => {
            w.string(label);
            w.string(content);
            w.i32(*to);
            w.i32(*ttl);
        }
        Message::DataSendConfirm { label, content, to } => {
            w.string(label);
            w.string(content);
            w.i32(*to);
        }
        Message::ReadyConfirm { ready, names } => {
            w.i32(*ready);
            w.json(names)?;
        }
        Message::ReadyDeny { description } => w.string(description),
        Message::Ping => {}
        Message::Ready {
            room,
            nickname,
            mode,
            ready_metadata,
        } => {
            w.string(room);
            w.string(nickname);
            w.u8(*mode);
            w.json(ready_metadata)?;
        }
        Message::Result(result) => {
            w.i32(result.player_id);
            w.i32(result.rando_id);
            w.json(&result.nicknames)?;
            w.json(&result.ready_metadata)?;
            w.json(&result.items_spoiler)?;
            w.json(&result.placements)?;
            w.json(&result.player_items_placements)?;
            w.string(&result.generated_hash);
        }
        Message::Save => {}
        Message::RandoGenerated { items, seed } => {
            w.json(items)?;
            w.json(seed)?;
        }
        Message::Unready => {}
        Message::InitiateGame { options } => w.json(options)?,
        Message::RequestRando => {}
        Message::AnnounceCharmNotchCosts {
            player_id,
            notch_costs,
        } => {
            w.i32(*player_id);
            w.json(notch_costs)?;
        }
        Message::RequestCharmNotchCosts => {}
        Message::ConfirmCharmNotchCostsReceived { player_id } => w.i32(*player_id),
        Message::DatasSend { datas } => w.json(datas)?,
        Message::DatasSendConfirm { count } => w.i32(*count),
        Message::InitiateSyncGame { settings } => w.json(settings)?,
        Message::ApplySettings { settings } => w.json(settings)?,
        Message::RequestSettings => {}
        Message::ISReady => {}
        Message::DatasReceive { datas } => w.json(datas)?,
        Message::DatasReceiveConfirm { count } => w.i32(*count),
        Message::ConnectedPlayersChanged { players } => w.json(players)?,
    }
    Ok(())
}

fn decode_payload(type_code: u32, payload: &[u8]) -> Result<Message, WireError> {
    let mut r = FieldReader::new(payload);
    let msg = match type_code {
        2 => Message::Connect {
            server_name: r.string()?,
        },
        3 => Message::Disconnect,
        4 => Message::Join {
            display_name: r.string()?,
            player_id: r.i32()?,
            rando_id: r.i32()?,
        },
        5 => Message::JoinConfirm,
        6 => Message::DataReceive {
            label: r.string()?,
            content: r.string()?,
            from: r.string()?,
            from_id: r.i32()?,
        },
        7 => Message::DataReceiveConfirm {
            label: r.string()?,
            data: r.string()?,
            from: r.string()?,
        },
        8 => Message::DataSend {
            label: r.string()?,
            content: r.string()?,
            to: r.i32()?,
            ttl: r.i32()?,
        },
        9 => Message::DataSendConfirm {
            label: r.string()?,
            content: r.string()?,
            to: r.i32()?,
        },
        10 => Message::ReadyConfirm {
            ready: r.i32()?,
            names: r.json()?,
        },
        11 => Message::ReadyDeny {
            description: r.string()?,
        },
        12 => Message::Ping,
        13 => Message::Ready {
            room: r.string()?,
            nickname: r.string()?,
            mode: r.u8()?,
            ready_metadata: r.json()?,
        },
        14 => Message::Result(super::ResultMessage {
            player_id: r.i32()?,
            rando_id: r.i32()?,
            nicknames: r.json()?,
            ready_metadata: r.json()?,
            items_spoiler: r.json()?,
            placements: r.json()?,
            player_items_placements: r.json()?,
            generated_hash: r.string()?,
        }),
        15 => Message::Save,
        16 => Message::RandoGenerated {
            items: r.json()?,
            seed: r.json()?,
        },
        17 => Message::Unready,
        18 => Message::InitiateGame { options: r.json()? },
        19 => Message::RequestRando,
        20 => Message::AnnounceCharmNotchCosts {
            player_id: r.i32()?,
            notch_costs: r.json()?,
        },
        21 => Message::RequestCharmNotchCosts,
        22 => Message::ConfirmCharmNotchCostsReceived {
            player_id: r.i32()?,
        },
        23 => Message::DatasSend { datas: r.json()? },
        24 => Message::DatasSendConfirm { count: r.i32()? },
        25 => Message::InitiateSyncGame { settings: r.json()? },
        26 => Message::ApplySettings { settings: r.json()? },
        27 => Message::RequestSettings,
        28 => Message::ISReady,
        29 => Message::DatasReceive { datas: r.json()? },
        30 => Message::DatasReceiveConfirm { count: r.i32()? },
        31 => Message::ConnectedPlayersChanged { players: r.json()? },
        other => return Err(WireError::UnknownType(other)),
    };
    Ok(msg)
}
