use dbgcore_encoding::{Decode, Encode, Stream};
use dbgcore_encoding_derive::GuestValue;

/// A toy stream that keeps one growable arena for everything `alloc`
/// returns and a single word-sized argument slot list, enough to exercise
/// the derive macro's layout and pointer-chasing logic without pulling in
/// a real emulator backend.
struct ArenaStream {
    pointer_size: usize,
    arena: Vec<u8>,
    words: Vec<Vec<u8>>,
}

impl ArenaStream {
    fn new(pointer_size: usize) -> Self {
        ArenaStream {
            pointer_size,
            arena: Vec::new(),
            words: Vec::new(),
        }
    }
}

impl Stream for ArenaStream {
    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn write_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        self.words.push(bytes.to_vec());
        Ok(())
    }

    fn read_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let word = self.words.remove(0);
        Ok(word[..size].to_vec())
    }

    fn write_float_word(&mut self, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        self.write_word(bytes)
    }

    fn read_float_word(&mut self, size: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        self.read_word(size)
    }

    fn alloc(&mut self, size: usize, align: usize) -> dbgcore_encoding::Result<u64> {
        let padded = (self.arena.len() + align - 1) & !(align - 1);
        self.arena.resize(padded, 0);
        let addr = self.arena.len() as u64;
        self.arena.resize(padded + size, 0);
        Ok(addr)
    }

    fn write_at(&mut self, addr: u64, bytes: &[u8]) -> dbgcore_encoding::Result<()> {
        let start = addr as usize;
        self.arena[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, addr: u64, len: usize) -> dbgcore_encoding::Result<Vec<u8>> {
        let start = addr as usize;
        Ok(self.arena[start..start + len].to_vec())
    }
}

#[derive(GuestValue, Debug, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

#[derive(GuestValue, Debug, PartialEq)]
struct Labeled {
    point: Point,
    name: String,
    #[guest(skip)]
    cached_hash: u64,
}

#[test]
fn roundtrips_a_plain_struct() {
    let mut stream = ArenaStream::new(8);
    let p = Point { x: 10, y: -20 };
    p.encode(&mut stream).unwrap();
    let decoded = Point::decode(&mut stream).unwrap();
    assert_eq!(p, decoded);
}

#[test]
fn roundtrips_nested_and_indirect_fields() {
    let mut stream = ArenaStream::new(4);
    let value = Labeled {
        point: Point { x: 1, y: 2 },
        name: "breakpoint".to_string(),
        cached_hash: 0xdead,
    };
    value.encode(&mut stream).unwrap();
    let decoded = Labeled::decode(&mut stream).unwrap();
    assert_eq!(decoded.point, value.point);
    assert_eq!(decoded.name, value.name);
    assert_eq!(decoded.cached_hash, 0); // skipped field never round-trips
}

#[test]
fn skipped_field_does_not_affect_block_size() {
    let size_with_pointer8 = <Labeled as dbgcore_encoding::EncodedSize>::encoded_size(8);
    // point(8 bytes padded to 4-align) + name pointer(8) = 16, regardless of
    // the u64 cached_hash field being entirely excluded from the layout.
    assert_eq!(size_with_pointer8, 16);
}
