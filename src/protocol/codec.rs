//! Byte-exact MQTT 3.1.1 framing.
//!
//! Fixed header: packet type nibble + flags nibble, then the remaining
//! length as a base-128 varint (at most 4 bytes), then the variable header
//! and payload. [`decode`] is incremental: it returns `Ok(None)` until a
//! whole frame is buffered, consumes exactly one frame otherwise, and
//! distinguishes malformed packet bodies (recoverable, the frame is
//! discarded) from broken framing (the connection must be dropped).

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest remaining-length value a 4-byte varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors raised while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The packet body violated the protocol. The frame has been consumed
    /// and the stream is still aligned on packet boundaries.
    #[error("malformed {packet}: {reason}")]
    Malformed { packet: &'static str, reason: String },

    /// The framing itself is broken; no further packet boundary can be
    /// trusted and the connection must be closed.
    #[error("unrecoverable framing error: {0}")]
    Framing(String),
}

/// Errors raised while encoding an outbound packet.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("string field exceeds 65535 bytes ({0} bytes)")]
    StringTooLong(usize),
    #[error("packet exceeds maximum remaining length ({0} bytes)")]
    PacketTooLarge(usize),
}

fn malformed(packet: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        packet,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), EncodeError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn string_len(s: &str) -> Result<usize, EncodeError> {
    if s.len() > u16::MAX as usize {
        return Err(EncodeError::StringTooLong(s.len()));
    }
    Ok(2 + s.len())
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_header(
    buf: &mut BytesMut,
    type_and_flags: u8,
    remaining: usize,
) -> Result<(), EncodeError> {
    buf.put_u8(type_and_flags);
    put_remaining_length(buf, remaining)
}

/// Serialize one control packet into `buf`.
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(c) => encode_connect(c, buf),
        Packet::ConnAck(a) => {
            put_header(buf, 0x20, 2)?;
            buf.put_u8(u8::from(a.session_present));
            buf.put_u8(a.code as u8);
            Ok(())
        }
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::PubAck { packet_id } => encode_ack(buf, 0x40, *packet_id),
        Packet::PubRec { packet_id } => encode_ack(buf, 0x50, *packet_id),
        // PUBREL carries the reserved flag bits 0b0010
        Packet::PubRel { packet_id } => encode_ack(buf, 0x62, *packet_id),
        Packet::PubComp { packet_id } => encode_ack(buf, 0x70, *packet_id),
        Packet::Subscribe(s) => encode_subscribe(s, buf),
        Packet::SubAck(s) => {
            put_header(buf, 0x90, 2 + s.return_codes.len())?;
            buf.put_u16(s.packet_id);
            for code in &s.return_codes {
                buf.put_u8(code.as_u8());
            }
            Ok(())
        }
        Packet::Unsubscribe(u) => encode_unsubscribe(u, buf),
        Packet::UnsubAck { packet_id } => encode_ack(buf, 0xB0, *packet_id),
        Packet::PingReq => put_header(buf, 0xC0, 0),
        Packet::PingResp => put_header(buf, 0xD0, 0),
        Packet::Disconnect => put_header(buf, 0xE0, 0),
    }
}

fn encode_ack(buf: &mut BytesMut, type_and_flags: u8, packet_id: u16) -> Result<(), EncodeError> {
    put_header(buf, type_and_flags, 2)?;
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_connect(c: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2; // name, level, flags, keep-alive
    remaining += string_len(&c.client_id)?;

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04 | (will.qos.as_u8() << 3);
        if will.retain {
            flags |= 0x20;
        }
        remaining += string_len(&will.topic)?;
        if will.payload.len() > u16::MAX as usize {
            return Err(EncodeError::StringTooLong(will.payload.len()));
        }
        remaining += 2 + will.payload.len();
    }
    if let Some(username) = &c.username {
        flags |= 0x80;
        remaining += string_len(username)?;
    }
    if let Some(password) = &c.password {
        flags |= 0x40;
        remaining += string_len(password)?;
    }

    put_header(buf, 0x10, remaining)?;
    put_string(buf, PROTOCOL_NAME);
    buf.put_u8(PROTOCOL_LEVEL);
    buf.put_u8(flags);
    buf.put_u16(c.keep_alive_secs);
    put_string(buf, &c.client_id);
    if let Some(will) = &c.will {
        put_string(buf, &will.topic);
        buf.put_u16(will.payload.len() as u16);
        buf.put_slice(&will.payload);
    }
    if let Some(username) = &c.username {
        put_string(buf, username);
    }
    if let Some(password) = &c.password {
        put_string(buf, password);
    }
    Ok(())
}

fn encode_publish(p: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut type_and_flags = 0x30 | (p.qos.as_u8() << 1);
    if p.dup {
        type_and_flags |= 0x08;
    }
    if p.retain {
        type_and_flags |= 0x01;
    }

    let mut remaining = string_len(&p.topic)?;
    if p.qos != QoS::AtMostOnce {
        remaining += 2;
    }
    remaining += p.payload.len();

    put_header(buf, type_and_flags, remaining)?;
    put_string(buf, &p.topic);
    if let Some(id) = p.packet_id {
        buf.put_u16(id);
    }
    buf.put_slice(&p.payload);
    Ok(())
}

fn encode_subscribe(s: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2;
    for (filter, _) in &s.filters {
        remaining += string_len(filter)? + 1;
    }
    // SUBSCRIBE carries the reserved flag bits 0b0010
    put_header(buf, 0x82, remaining)?;
    buf.put_u16(s.packet_id);
    for (filter, qos) in &s.filters {
        put_string(buf, filter);
        buf.put_u8(qos.as_u8());
    }
    Ok(())
}

fn encode_unsubscribe(u: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2;
    for filter in &u.filters {
        remaining += string_len(filter)?;
    }
    put_header(buf, 0xA2, remaining)?;
    buf.put_u16(u.packet_id);
    for filter in &u.filters {
        put_string(buf, filter);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Try to decode one packet out of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// callers should read more bytes and retry. On `Ok(Some(_))` and
/// `Err(DecodeError::Malformed { .. })` exactly one frame has been consumed.
pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let (remaining, header_len) = match read_remaining_length(&buf[1..])? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    let frame_len = 1 + header_len + remaining;
    if frame_len > max_packet_size {
        return Err(DecodeError::Framing(format!(
            "frame of {frame_len} bytes exceeds maximum packet size {max_packet_size}"
        )));
    }
    if buf.len() < frame_len {
        return Ok(None);
    }

    buf.advance(1 + header_len);
    let body = buf.split_to(remaining).freeze();
    parse_body(first, body).map(Some)
}

/// Decode a remaining-length varint. Returns `(value, bytes_consumed)`, or
/// `None` when more bytes are needed.
fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(DecodeError::Framing(
                "remaining length varint exceeds 4 bytes".to_string(),
            ));
        }
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    if bytes.len() >= 4 {
        return Err(DecodeError::Framing(
            "remaining length varint exceeds 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

struct Cursor {
    packet: &'static str,
    body: Bytes,
}

impl Cursor {
    fn new(packet: &'static str, body: Bytes) -> Self {
        Cursor { packet, body }
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        if self.body.remaining() < 1 {
            return Err(malformed(self.packet, "truncated body"));
        }
        Ok(self.body.get_u8())
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        if self.body.remaining() < 2 {
            return Err(malformed(self.packet, "truncated body"));
        }
        Ok(self.body.get_u16())
    }

    fn take_bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.take_u16()? as usize;
        if self.body.remaining() < len {
            return Err(malformed(self.packet, "length prefix past end of body"));
        }
        Ok(self.body.split_to(len))
    }

    fn take_string(&mut self) -> Result<String, DecodeError> {
        let raw = self.take_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| malformed(self.packet, "string field is not valid UTF-8"))
    }

    fn rest(&mut self) -> Bytes {
        self.body.split_off(0)
    }

    fn remaining(&self) -> usize {
        self.body.remaining()
    }

    fn expect_empty(self) -> Result<(), DecodeError> {
        if self.body.has_remaining() {
            return Err(malformed(self.packet, "trailing bytes after packet body"));
        }
        Ok(())
    }
}

fn parse_body(first: u8, body: Bytes) -> Result<Packet, DecodeError> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;
    match packet_type {
        1 => parse_connect(flags, body),
        2 => parse_connack(flags, body),
        3 => parse_publish(flags, body),
        4 => parse_only_packet_id("PUBACK", flags, 0, body).map(|id| Packet::PubAck { packet_id: id }),
        5 => parse_only_packet_id("PUBREC", flags, 0, body).map(|id| Packet::PubRec { packet_id: id }),
        6 => parse_only_packet_id("PUBREL", flags, 2, body).map(|id| Packet::PubRel { packet_id: id }),
        7 => parse_only_packet_id("PUBCOMP", flags, 0, body).map(|id| Packet::PubComp { packet_id: id }),
        8 => parse_subscribe(flags, body),
        9 => parse_suback(flags, body),
        10 => parse_unsubscribe(flags, body),
        11 => parse_only_packet_id("UNSUBACK", flags, 0, body).map(|id| Packet::UnsubAck { packet_id: id }),
        12 => parse_empty("PINGREQ", flags, body).map(|_| Packet::PingReq),
        13 => parse_empty("PINGRESP", flags, body).map(|_| Packet::PingResp),
        14 => parse_empty("DISCONNECT", flags, body).map(|_| Packet::Disconnect),
        other => Err(malformed("packet", format!("reserved packet type {other}"))),
    }
}

fn check_flags(packet: &'static str, flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(malformed(
            packet,
            format!("fixed header flags 0x{flags:X}, expected 0x{expected:X}"),
        ));
    }
    Ok(())
}

fn parse_empty(packet: &'static str, flags: u8, body: Bytes) -> Result<(), DecodeError> {
    check_flags(packet, flags, 0)?;
    Cursor::new(packet, body).expect_empty()
}

fn parse_only_packet_id(
    packet: &'static str,
    flags: u8,
    expected_flags: u8,
    body: Bytes,
) -> Result<u16, DecodeError> {
    check_flags(packet, flags, expected_flags)?;
    let mut cursor = Cursor::new(packet, body);
    let id = cursor.take_u16()?;
    cursor.expect_empty()?;
    if id == 0 {
        return Err(malformed(packet, "packet identifier 0 is not allowed"));
    }
    Ok(id)
}

fn parse_connect(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    check_flags("CONNECT", flags, 0)?;
    let mut cursor = Cursor::new("CONNECT", body);

    let protocol = cursor.take_string()?;
    if protocol != PROTOCOL_NAME {
        return Err(malformed("CONNECT", format!("protocol name {protocol:?}")));
    }
    let level = cursor.take_u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(malformed("CONNECT", format!("protocol level {level}")));
    }

    let connect_flags = cursor.take_u8()?;
    if connect_flags & 0x01 != 0 {
        return Err(malformed("CONNECT", "reserved flag bit set"));
    }
    let keep_alive_secs = cursor.take_u16()?;
    let client_id = cursor.take_string()?;

    let will = if connect_flags & 0x04 != 0 {
        let topic = cursor.take_string()?;
        let payload = cursor.take_bytes()?;
        let qos = QoS::try_from_u8((connect_flags >> 3) & 0x03)
            .map_err(|q| malformed("CONNECT", format!("will QoS {q}")))?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: connect_flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if connect_flags & 0x80 != 0 {
        Some(cursor.take_string()?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        Some(cursor.take_string()?)
    } else {
        None
    };
    cursor.expect_empty()?;

    Ok(Packet::Connect(Connect {
        client_id,
        clean_session: connect_flags & 0x02 != 0,
        keep_alive_secs,
        will,
        username,
        password,
    }))
}

fn parse_connack(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    check_flags("CONNACK", flags, 0)?;
    let mut cursor = Cursor::new("CONNACK", body);
    let ack_flags = cursor.take_u8()?;
    if ack_flags & !0x01 != 0 {
        return Err(malformed("CONNACK", "reserved acknowledge flags set"));
    }
    let code = cursor.take_u8()?;
    cursor.expect_empty()?;
    let code = ConnectReturnCode::try_from_u8(code)
        .map_err(|c| malformed("CONNACK", format!("return code {c}")))?;
    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn parse_publish(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    let qos = QoS::try_from_u8((flags >> 1) & 0x03)
        .map_err(|q| malformed("PUBLISH", format!("QoS {q}")))?;
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(malformed("PUBLISH", "DUP set on a QoS 0 publish"));
    }

    let mut cursor = Cursor::new("PUBLISH", body);
    let topic = cursor.take_string()?;
    let packet_id = if qos != QoS::AtMostOnce {
        let id = cursor.take_u16()?;
        if id == 0 {
            return Err(malformed("PUBLISH", "packet identifier 0 is not allowed"));
        }
        Some(id)
    } else {
        None
    };
    let payload = cursor.rest();

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn parse_subscribe(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    check_flags("SUBSCRIBE", flags, 2)?;
    let mut cursor = Cursor::new("SUBSCRIBE", body);
    let packet_id = cursor.take_u16()?;
    let mut filters = Vec::new();
    while cursor.remaining() > 0 {
        let filter = cursor.take_string()?;
        let qos = QoS::try_from_u8(cursor.take_u8()?)
            .map_err(|q| malformed("SUBSCRIBE", format!("requested QoS {q}")))?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(malformed("SUBSCRIBE", "no topic filters"));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn parse_suback(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    check_flags("SUBACK", flags, 0)?;
    let mut cursor = Cursor::new("SUBACK", body);
    let packet_id = cursor.take_u16()?;
    let rest = cursor.rest();
    if rest.is_empty() {
        return Err(malformed("SUBACK", "no return codes"));
    }
    let mut return_codes = Vec::with_capacity(rest.len());
    for byte in rest.iter() {
        let code = SubscribeReturnCode::try_from_u8(*byte)
            .map_err(|c| malformed("SUBACK", format!("return code 0x{c:X}")))?;
        return_codes.push(code);
    }
    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn parse_unsubscribe(flags: u8, body: Bytes) -> Result<Packet, DecodeError> {
    check_flags("UNSUBSCRIBE", flags, 2)?;
    let mut cursor = Cursor::new("UNSUBSCRIBE", body);
    let packet_id = cursor.take_u16()?;
    let mut filters = Vec::new();
    while cursor.remaining() > 0 {
        filters.push(cursor.take_string()?);
    }
    if filters.is_empty() {
        return Err(malformed("UNSUBSCRIBE", "no topic filters"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 256 * 1024;

    fn encoded(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(packet, &mut buf).expect("encode should succeed");
        buf
    }

    #[test]
    fn test_remaining_length_encoding() {
        let mut buf = BytesMut::new();
        put_remaining_length(&mut buf, 0).unwrap();
        assert_eq!(&buf[..], &[0x00]);

        buf.clear();
        put_remaining_length(&mut buf, 127).unwrap();
        assert_eq!(&buf[..], &[0x7F]);

        buf.clear();
        put_remaining_length(&mut buf, 128).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x01]);

        buf.clear();
        put_remaining_length(&mut buf, 16_383).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0x7F]);

        buf.clear();
        assert!(put_remaining_length(&mut buf, MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn test_remaining_length_decoding() {
        assert_eq!(read_remaining_length(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(read_remaining_length(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        // Continuation bit set with no further bytes: need more data
        assert_eq!(read_remaining_length(&[0x80]).unwrap(), None);
        // Five continuation bytes can never be valid
        assert!(read_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_connect_wire_format() {
        let connect = Packet::Connect(Connect {
            client_id: "dev".to_string(),
            clean_session: true,
            keep_alive_secs: 60,
            will: None,
            username: None,
            password: None,
        });
        let buf = encoded(&connect);

        // type 1, remaining = 10 (variable header) + 5 (client id)
        assert_eq!(buf[0], 0x10);
        assert_eq!(buf[1], 15);
        // protocol name "MQTT", level 4, flags: clean session only
        assert_eq!(&buf[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(buf[8], 4);
        assert_eq!(buf[9], 0x02);
        // keep-alive 60
        assert_eq!(&buf[10..12], &[0x00, 60]);
        // client id
        assert_eq!(&buf[12..], &[0x00, 0x03, b'd', b'e', b'v']);
    }

    #[test]
    fn test_connect_flags_with_credentials_and_will() {
        let connect = Packet::Connect(Connect {
            client_id: "c".to_string(),
            clean_session: false,
            keep_alive_secs: 30,
            will: Some(Will {
                topic: "last/will".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
        });
        let buf = encoded(&connect);
        // username | password | will retain | will qos 1 | will flag
        assert_eq!(buf[9], 0x80 | 0x40 | 0x20 | 0x08 | 0x04);

        let mut bytes = BytesMut::from(&buf[..]);
        let decoded = decode(&mut bytes, MAX).unwrap().unwrap();
        assert_eq!(decoded, connect);
    }

    #[test]
    fn test_publish_header_flags() {
        let publish = Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"hi"),
        });
        let buf = encoded(&publish);
        // 0x30 | dup(0x08) | qos1(0x02) | retain(0x01)
        assert_eq!(buf[0], 0x3B);
        // remaining = 2 + 3 (topic) + 2 (packet id) + 2 (payload)
        assert_eq!(buf[1], 9);

        let mut bytes = BytesMut::from(&buf[..]);
        assert_eq!(decode(&mut bytes, MAX).unwrap().unwrap(), publish);
        assert!(bytes.is_empty(), "frame should be fully consumed");
    }

    #[test]
    fn test_qos0_publish_has_no_packet_id() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        });
        let buf = encoded(&publish);
        assert_eq!(buf[0], 0x30);
        assert_eq!(buf[1], 4); // 2 + 1 topic + 1 payload
    }

    #[test]
    fn test_decode_incomplete_frame_returns_none() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "sensors/temp".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"21.5"),
        });
        let full = encoded(&publish);

        // Feed the frame one byte at a time; decode must not consume anything
        // until the frame is whole.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decode(&mut buf, MAX).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none(), "partial frame decoded at byte {i}");
            } else {
                assert_eq!(result.unwrap(), publish);
            }
        }
    }

    #[test]
    fn test_decode_two_packets_back_to_back() {
        let mut buf = BytesMut::new();
        encode(&Packet::PingReq, &mut buf).unwrap();
        encode(&Packet::PubAck { packet_id: 3 }, &mut buf).unwrap();

        assert_eq!(decode(&mut buf, MAX).unwrap().unwrap(), Packet::PingReq);
        assert_eq!(
            decode(&mut buf, MAX).unwrap().unwrap(),
            Packet::PubAck { packet_id: 3 }
        );
        assert_eq!(decode(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn test_malformed_body_consumes_frame() {
        // CONNACK with an out-of-range return code: recoverable, the
        // following packet must still decode.
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x99][..]);
        encode(&Packet::PingResp, &mut buf).unwrap();

        let err = decode(&mut buf, MAX).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(decode(&mut buf, MAX).unwrap().unwrap(), Packet::PingResp);
    }

    #[test]
    fn test_oversized_frame_is_unrecoverable() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x30);
        put_remaining_length(&mut buf, 1024).unwrap();
        let err = decode(&mut buf, 128).unwrap_err();
        assert!(matches!(err, DecodeError::Framing(_)));
    }

    #[test]
    fn test_pubrel_requires_reserved_flags() {
        // PUBREL with flags 0000 instead of 0010
        let mut buf = BytesMut::from(&[0x60, 0x02, 0x00, 0x05][..]);
        let err = decode(&mut buf, MAX).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_zero_packet_id_rejected() {
        let mut buf = BytesMut::from(&[0x40, 0x02, 0x00, 0x00][..]);
        let err = decode(&mut buf, MAX).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_subscribe_and_suback() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 11,
            filters: vec![
                ("sensors/+/temp".to_string(), QoS::AtLeastOnce),
                ("alerts/#".to_string(), QoS::ExactlyOnce),
            ],
        });
        let mut buf = encoded(&subscribe);
        assert_eq!(buf[0], 0x82);
        assert_eq!(decode(&mut buf, MAX).unwrap().unwrap(), subscribe);

        let suback = Packet::SubAck(SubAck {
            packet_id: 11,
            return_codes: vec![
                SubscribeReturnCode::Granted(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        });
        let mut buf = encoded(&suback);
        assert_eq!(decode(&mut buf, MAX).unwrap().unwrap(), suback);
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: 9,
            filters: vec!["a/b".to_string(), "c".to_string()],
        });
        let mut buf = encoded(&unsubscribe);
        assert_eq!(buf[0], 0xA2);
        assert_eq!(decode(&mut buf, MAX).unwrap().unwrap(), unsubscribe);
    }
}
