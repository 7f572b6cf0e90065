use bytes::Bytes;

/// Transport-neutral websocket frame type.
///
/// Transports convert their native frame representation into/from `WsFrame`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsFrame {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: &'static str) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: Bytes::from_static(reason.as_bytes()),
        }))
    }

    /// Payload of a data frame as UTF-8, if it is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// Borrow the payload of data frames without allocation.
///
/// Control frames carry no application message and yield `None`.
#[inline]
pub fn data_bytes(frame: &WsFrame) -> Option<&[u8]> {
    match frame {
        WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
        WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_carry_no_data() {
        assert_eq!(data_bytes(&WsFrame::Ping(Bytes::from_static(b"x"))), None);
        assert_eq!(data_bytes(&WsFrame::close(1000, "bye")), None);
        assert_eq!(data_bytes(&WsFrame::text("{}")), Some(&b"{}"[..]));
    }

    #[test]
    fn binary_utf8_is_readable_as_text() {
        let frame = WsFrame::Binary(Bytes::from_static(b"{\"type\":\"pong\"}"));
        assert_eq!(frame.as_text(), Some("{\"type\":\"pong\"}"));
        assert_eq!(WsFrame::Binary(Bytes::from_static(&[0xff])).as_text(), None);
    }
}
