use crate::{header, Command, Frame, ProtoError};

/// One unit decoded from a transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A bare end-of-line keep-alive.
    Heartbeat,
    Frame(Frame),
}

/// Serializes a frame, adding `content-length` for non-empty bodies.
pub fn encode(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(64 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');

    let mut has_length = false;
    for (name, value) in frame.headers() {
        has_length |= name == header::CONTENT_LENGTH;
        push_header_part(&mut out, name, escape);
        out.push(':');
        push_header_part(&mut out, value, escape);
        out.push('\n');
    }
    if !has_length && !frame.body.is_empty() {
        out.push_str(header::CONTENT_LENGTH);
        out.push(':');
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decodes every frame carried by one transport message.
///
/// A message made only of line breaks decodes to a single
/// [`Inbound::Heartbeat`]. Line breaks between frames are skipped. Fails on
/// the first broken frame; see [`decode_each`] to keep the others.
pub fn decode(input: &str) -> Result<Vec<Inbound>, ProtoError> {
    let decoded = decode_each(input);
    if let Some(err) = decoded.errors.into_iter().next() {
        return Err(err);
    }
    if decoded.inbound.is_empty() {
        return Err(ProtoError::EmptyFrame);
    }
    Ok(decoded.inbound)
}

/// Outcome of decoding a message one frame at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub inbound: Vec<Inbound>,
    /// One entry per frame that was skipped.
    pub errors: Vec<ProtoError>,
}

/// Decodes frame by frame. A broken frame is skipped up to its NUL
/// terminator and the frames after it are still decoded. Without a
/// terminator the rest of the message is lost.
pub fn decode_each(input: &str) -> Decoded {
    let mut decoded = Decoded::default();
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start_matches(is_eol);
        if trimmed.is_empty() {
            if decoded.inbound.is_empty() && decoded.errors.is_empty() && !rest.is_empty() {
                decoded.inbound.push(Inbound::Heartbeat);
            }
            break;
        }
        match decode_frame(trimmed) {
            Ok((frame, remaining)) => {
                decoded.inbound.push(Inbound::Frame(frame));
                rest = remaining;
            }
            Err(err) => {
                decoded.errors.push(err);
                match trimmed.find('\0') {
                    Some(end) => rest = &trimmed[end + 1..],
                    None => break,
                }
            }
        }
    }
    decoded
}

fn decode_frame(input: &str) -> Result<(Frame, &str), ProtoError> {
    let (command_line, mut rest) = split_line(input).ok_or(ProtoError::UnterminatedFrame)?;
    let command: Command = command_line.parse()?;
    let escape = command.escapes_headers();
    let mut frame = Frame::new(command);

    loop {
        let (line, after) = split_line(rest).ok_or(ProtoError::UnterminatedFrame)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtoError::MalformedHeader(line.to_string()))?;
        if escape {
            frame.push_header(unescape(name)?, unescape(value)?);
        } else {
            frame.push_header(name, value);
        }
    }

    let body_len = match frame.get(header::CONTENT_LENGTH) {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .map_err(|_| ProtoError::InvalidContentLength(raw.to_string()))?,
        ),
        None => None,
    };

    let (body, remaining) = match body_len {
        Some(len) => {
            if rest.len() < len {
                return Err(ProtoError::UnterminatedFrame);
            }
            if !rest.is_char_boundary(len) {
                return Err(ProtoError::InvalidContentLength(len.to_string()));
            }
            let (body, tail) = rest.split_at(len);
            let tail = tail
                .strip_prefix('\0')
                .ok_or(ProtoError::UnterminatedFrame)?;
            (body, tail)
        }
        None => {
            let end = rest.find('\0').ok_or(ProtoError::UnterminatedFrame)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    frame.body = body.to_string();
    Ok((frame, remaining))
}

fn is_eol(ch: char) -> bool {
    ch == '\n' || ch == '\r'
}

fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = &input[..idx];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &input[idx + 1..]))
}

fn push_header_part(out: &mut String, raw: &str, escape: bool) {
    if !escape {
        out.push_str(raw);
        return;
    }
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, ProtoError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(ProtoError::InvalidEscape(format!("\\{other}"))),
            None => return Err(ProtoError::InvalidEscape("\\".to_string())),
        }
    }
    Ok(out)
}
