//! Record framing for delimited byte streams
//!
//! The engine's streaming endpoints deliver one JSON object per `\n`; the
//! transport delivers bytes in whatever chunks it pleases. [`RecordFramer`]
//! reassembles the records regardless of where the chunk boundaries fall.
//! [`find_header_end`] locates the `\r\n\r\n` header terminator the HTTP
//! paths need.

/// Splits an arbitrarily chunked byte stream into delimiter-separated
/// records.
///
/// Incoming chunks accumulate in a carry-over buffer. [`next_record`]
/// yields the bytes up to (not including) the next delimiter and leaves the
/// remainder buffered for later chunks, so a record may span any number of
/// chunks and a delimiter may arrive split from its record. The yielded
/// bytes are complete by construction; decoding (UTF-8, JSON) must happen on
/// them and never on a raw chunk, otherwise a multi-byte character straddling
/// a chunk boundary would be torn apart.
///
/// [`next_record`]: RecordFramer::next_record
#[derive(Debug)]
pub struct RecordFramer {
    delimiter: u8,
    buffer: Vec<u8>,
}

impl RecordFramer {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buffer: Vec::new(),
        }
    }

    /// Framer for `\n`-separated JSON-lines streams.
    pub fn lines() -> Self {
        Self::new(b'\n')
    }

    /// Append one incoming chunk to the carry-over buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete record, if one is buffered.
    ///
    /// Returns `None` when no delimiter is buffered yet; the partial data
    /// stays queued for the next [`push`](RecordFramer::push).
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        let position = self.buffer.iter().position(|&byte| byte == self.delimiter)?;
        let mut record: Vec<u8> = self.buffer.drain(..=position).collect();
        record.pop(); // drop the delimiter itself
        Some(record)
    }

    /// Bytes buffered after the last delimiter.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Take whatever trails the final delimiter (used at stream end).
    pub fn take_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Locate the end of an HTTP header block (`\r\n\r\n`) in `buf`.
///
/// Returns the index one past the terminator. Callers rescan from the start
/// on every new chunk; header blocks are small and bounded, so the naive
/// scan is fine.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut RecordFramer) -> Vec<String> {
        let mut records = Vec::new();
        while let Some(record) = framer.next_record() {
            records.push(String::from_utf8(record).unwrap());
        }
        records
    }

    #[test]
    fn test_single_chunk_multiple_records() {
        let mut framer = RecordFramer::lines();
        framer.push(b"one\ntwo\nthree\n");
        assert_eq!(drain(&mut framer), ["one", "two", "three"]);
        assert!(framer.remainder().is_empty());
    }

    #[test]
    fn test_delimiter_straddles_chunks() {
        let mut framer = RecordFramer::lines();
        framer.push(b"abc");
        assert_eq!(framer.next_record(), None);

        framer.push(b"\ndef\n");
        assert_eq!(drain(&mut framer), ["abc", "def"]);
    }

    #[test]
    fn test_record_spans_many_chunks() {
        let mut framer = RecordFramer::lines();
        framer.push(b"{\"a\":");
        framer.push(b" 1, ");
        framer.push(b"\"b\": 2}");
        assert_eq!(framer.next_record(), None);
        framer.push(b"\n");
        assert_eq!(drain(&mut framer), ["{\"a\": 1, \"b\": 2}"]);
    }

    #[test]
    fn test_empty_records_preserved() {
        let mut framer = RecordFramer::lines();
        framer.push(b"\n\nx\n");
        assert_eq!(drain(&mut framer), ["", "", "x"]);
    }

    #[test]
    fn test_remainder_left_for_next_chunk() {
        let mut framer = RecordFramer::lines();
        framer.push(b"complete\npart");
        assert_eq!(drain(&mut framer), ["complete"]);
        assert_eq!(framer.remainder(), b"part");
        assert_eq!(framer.take_remainder(), b"part");
        assert!(framer.remainder().is_empty());
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        // "€" is three bytes: e2 82 ac. Split it mid-character.
        let bytes = "price:€5\n".as_bytes();
        let mut framer = RecordFramer::lines();
        framer.push(&bytes[..7]); // ends one byte into the euro sign
        assert_eq!(framer.next_record(), None);
        framer.push(&bytes[7..]);
        assert_eq!(drain(&mut framer), ["price:€5"]);
    }

    #[test]
    fn test_any_partition_yields_same_records() {
        let input = "first\n{\"key\":\"välüe\"}\n\nlast record\n".as_bytes();

        let mut whole = RecordFramer::lines();
        whole.push(input);
        let expected = drain(&mut whole);

        // Split at every possible boundary, including mid-character ones.
        for split in 0..=input.len() {
            let mut framer = RecordFramer::lines();
            framer.push(&input[..split]);
            let mut records = drain(&mut framer);
            framer.push(&input[split..]);
            records.extend(drain(&mut framer));
            assert_eq!(records, expected, "split at byte {split}");
        }

        // And one byte-at-a-time pass.
        let mut framer = RecordFramer::lines();
        let mut records = Vec::new();
        for byte in input {
            framer.push(std::slice::from_ref(byte));
            records.extend(drain(&mut framer));
        }
        assert_eq!(records, expected);
    }

    #[test]
    fn test_nul_delimited_records() {
        let mut framer = RecordFramer::new(0);
        framer.push(b"alpha\x00beta\x00");
        assert_eq!(drain(&mut framer), ["alpha", "beta"]);
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b""), None);
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\r\n"), None);
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\r\n\r\n"), Some(19));
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\r\n\r\nbody"), Some(19));
        // Partial terminator is not a match until the rest arrives.
        assert_eq!(find_header_end(b"head\r\n\r"), None);
        assert_eq!(find_header_end(b"head\r\n\r\n"), Some(8));
    }
}
