use crate::Result;

/// The register/stack/heap substrate that [`crate::Encode`] and
/// [`crate::Decode`] impls write into and read from.
///
/// A concrete implementation (`dbgcore`'s `PointerStream`) knows which ABI
/// it is marshalling for and routes `write_word`/`write_float_word` to the
/// right register file, spilling to the stack once that file is exhausted.
/// Everything in this crate is ABI-agnostic; it only ever calls through this
/// trait. Nested composite content (struct fields, array elements) is
/// marshalled through a [`BlockStream`] instead, which implements the same
/// trait over a flat allocated region rather than the argument list.
pub trait Stream {
    /// Size in bytes of a guest pointer for the ABI this stream targets.
    fn pointer_size(&self) -> usize;

    /// Writes an integer/pointer-sized word (1, 2, 4 or 8 bytes) to the next
    /// general-purpose argument slot, spilling to the stack once the
    /// register file is exhausted.
    fn write_word(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_word(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Writes a float/double word to the next VFP/SIMD argument slot.
    fn write_float_word(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_float_word(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Allocates `size` bytes of guest memory aligned to `align`, for
    /// fields encoded indirectly (pointers, slices, strings), and returns
    /// its address. The caller is responsible for filling it via
    /// `write_at`.
    fn alloc(&mut self, size: usize, align: usize) -> Result<u64>;

    fn write_at(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;
    fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;
}

/// A [`Stream`] over a single already-allocated, fixed-size block of guest
/// memory, used to marshal the contents a pointer slot points at (struct
/// fields, fixed-size array elements). `write_word`/`read_word` just append
/// at the block's own cursor instead of touching argument registers;
/// `alloc` still delegates to the parent stream, since a nested indirect
/// field (e.g. a `String` inside a struct) owns its own independent
/// allocation rather than living inside this block.
pub struct BlockStream<'a> {
    parent: &'a mut dyn Stream,
    base: u64,
    cursor: u64,
}

impl<'a> BlockStream<'a> {
    pub fn new(parent: &'a mut dyn Stream, base: u64) -> Self {
        BlockStream {
            parent,
            base,
            cursor: 0,
        }
    }
}

impl<'a> Stream for BlockStream<'a> {
    fn pointer_size(&self) -> usize {
        self.parent.pointer_size()
    }

    fn write_word(&mut self, bytes: &[u8]) -> Result<()> {
        self.parent.write_at(self.base + self.cursor, bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(())
    }

    fn read_word(&mut self, size: usize) -> Result<Vec<u8>> {
        let out = self.parent.read_at(self.base + self.cursor, size)?;
        self.cursor += size as u64;
        Ok(out)
    }

    fn write_float_word(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_word(bytes)
    }

    fn read_float_word(&mut self, size: usize) -> Result<Vec<u8>> {
        self.read_word(size)
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<u64> {
        self.parent.alloc(size, align)
    }

    fn write_at(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.parent.write_at(addr, bytes)
    }

    fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.parent.read_at(addr, len)
    }
}
