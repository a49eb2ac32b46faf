/// Collects detokenized pieces and hands out only complete UTF-8.
///
/// A single token can end in the middle of a multi-byte character, so the
/// tail of one piece is kept until the next piece completes it.
#[derive(Debug, Default)]
pub struct Utf8EmitBuffer {
    buf: Vec<u8>,
}

// Upper bound on bytes held while waiting for a valid prefix.
const MAX_PENDING: usize = 8192;

impl Utf8EmitBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push_and_take_valid(&mut self, bytes: &[u8]) -> String {
        // NULs would end the string early on the Java side.
        self.buf.extend(bytes.iter().copied().filter(|b| *b != 0));

        match std::str::from_utf8(&self.buf) {
            Ok(s) => {
                let out = s.to_string();
                self.buf.clear();
                out
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to == 0 {
                    if self.buf.len() > MAX_PENDING || e.error_len().is_some() {
                        return self.flush_lossy();
                    }
                    return String::new();
                }

                let rest = self.buf.split_off(valid_up_to);
                let valid = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf = rest;
                valid
            }
        }
    }

    pub fn flush_lossy(&mut self) -> String {
        if self.buf.is_empty() {
            return String::new();
        }
        let s = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        s
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_character() {
        let mut buffer = Utf8EmitBuffer::new();
        let snowman = "☃".as_bytes();

        assert_eq!(buffer.push_and_take_valid(&snowman[..1]), "");
        assert_eq!(buffer.push_and_take_valid(&snowman[1..2]), "");
        assert_eq!(buffer.push_and_take_valid(&snowman[2..]), "☃");
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_valid_prefix_released_tail_kept() {
        let mut buffer = Utf8EmitBuffer::new();
        let mut piece = b"ok ".to_vec();
        piece.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(buffer.push_and_take_valid(&piece), "ok ");
        assert_eq!(buffer.pending(), 1);
        assert_eq!(buffer.push_and_take_valid(&"é".as_bytes()[1..]), "é");
    }

    #[test]
    fn test_nul_bytes_dropped() {
        let mut buffer = Utf8EmitBuffer::new();
        assert_eq!(buffer.push_and_take_valid(b"a\0b"), "ab");
    }

    #[test]
    fn test_invalid_bytes_do_not_stall() {
        let mut buffer = Utf8EmitBuffer::new();
        assert_eq!(buffer.push_and_take_valid(&[0xff, b'x']), "\u{fffd}x");
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_flush_lossy_drains_remainder() {
        let mut buffer = Utf8EmitBuffer::new();
        buffer.push_and_take_valid(&"☃".as_bytes()[..2]);
        assert_eq!(buffer.flush_lossy(), "\u{fffd}");
        assert_eq!(buffer.flush_lossy(), "");
    }
}
