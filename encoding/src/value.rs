use crate::{align::align_up, BlockStream, EncodingError, Result, Stream};

/// Byte size a type occupies inside a containing block, for the given ABI
/// pointer width. Scalars ignore `pointer_size`; indirect types (`String`,
/// `Option`, pointers) always report `pointer_size` itself, since only a
/// pointer slot lives in the block and the pointee is allocated separately.
/// This is why the derive macro computes struct layout at runtime instead
/// of baking in a fixed size: the same struct type has a different block
/// size on ARM (4-byte pointers) than on ARM64 (8-byte pointers).
pub trait EncodedSize {
    fn encoded_size(pointer_size: usize) -> usize;
}

/// Alignment this type demands inside a containing composite, for the given
/// ABI pointer width.
pub trait NaturalAlign {
    fn natural_align(pointer_size: usize) -> usize;
}

/// Marshals `Self` onto a [`Stream`] following the calling convention the
/// stream was constructed for.
///
/// Scalars write directly into the next argument word. Composite and
/// variable-length values (structs, arrays, strings, options) allocate a
/// block via [`Stream::alloc`] and write only a pointer word into the
/// argument stream, then marshal their contents into the block through a
/// [`BlockStream`].
pub trait Encode: EncodedSize + NaturalAlign {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()>;
}

pub trait Decode: Sized + EncodedSize + NaturalAlign {
    fn decode(stream: &mut dyn Stream) -> Result<Self>;
}

macro_rules! impl_scalar {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl EncodedSize for $ty {
            fn encoded_size(_pointer_size: usize) -> usize {
                $size
            }
        }

        impl NaturalAlign for $ty {
            fn natural_align(_pointer_size: usize) -> usize {
                $size
            }
        }

        impl Encode for $ty {
            fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
                stream.$write(&self.to_le_bytes())
            }
        }

        impl Decode for $ty {
            fn decode(stream: &mut dyn Stream) -> Result<Self> {
                let bytes = stream.$read($size)?;
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl_scalar!(u8, 1, write_word, read_word);
impl_scalar!(i8, 1, write_word, read_word);
impl_scalar!(u16, 2, write_word, read_word);
impl_scalar!(i16, 2, write_word, read_word);
impl_scalar!(u32, 4, write_word, read_word);
impl_scalar!(i32, 4, write_word, read_word);
impl_scalar!(u64, 8, write_word, read_word);
impl_scalar!(i64, 8, write_word, read_word);
impl_scalar!(f32, 4, write_float_word, read_float_word);
impl_scalar!(f64, 8, write_float_word, read_float_word);

impl EncodedSize for bool {
    fn encoded_size(_pointer_size: usize) -> usize {
        1
    }
}

impl NaturalAlign for bool {
    fn natural_align(_pointer_size: usize) -> usize {
        1
    }
}

impl Encode for bool {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        stream.write_word(&[*self as u8])
    }
}

impl Decode for bool {
    fn decode(stream: &mut dyn Stream) -> Result<Self> {
        Ok(stream.read_word(1)?[0] != 0)
    }
}

/// A NUL-terminated guest string, encoded indirectly: the argument slot
/// gets a pointer to a freshly allocated block holding the UTF-8 bytes plus
/// a trailing NUL.
impl EncodedSize for String {
    fn encoded_size(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl NaturalAlign for String {
    fn natural_align(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl Encode for String {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        let addr = stream.alloc(self.len() + 1, 1)?;
        let mut bytes = self.as_bytes().to_vec();
        bytes.push(0);
        stream.write_at(addr, &bytes)?;
        stream.write_word(&addr.to_le_bytes()[..stream.pointer_size()])
    }
}

impl Decode for String {
    fn decode(stream: &mut dyn Stream) -> Result<Self> {
        let ptr_size = stream.pointer_size();
        let addr_bytes = stream.read_word(ptr_size)?;
        let mut buf = [0u8; 8];
        buf[..ptr_size].copy_from_slice(&addr_bytes);
        let addr = u64::from_le_bytes(buf);
        if addr == 0 {
            return Ok(String::new());
        }
        let mut out = Vec::new();
        let mut cur = addr;
        loop {
            let byte = stream.read_at(cur, 1)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            cur += 1;
        }
        String::from_utf8(out).map_err(|_| EncodingError::InvalidUtf8)
    }
}

/// A nullable indirect value: `None` writes a null pointer word and
/// allocates nothing; `Some(v)` allocates a block sized for `T` and
/// marshals `v` into it through a [`BlockStream`].
impl<T: EncodedSize> EncodedSize for Option<T> {
    fn encoded_size(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T: NaturalAlign> NaturalAlign for Option<T> {
    fn natural_align(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        match self {
            None => stream.write_word(&vec![0u8; stream.pointer_size()]),
            Some(v) => {
                let ptr_size = stream.pointer_size();
                let size = T::encoded_size(ptr_size).max(1);
                let align = T::natural_align(ptr_size).max(1);
                let addr = stream.alloc(size, align)?;
                {
                    let mut block = BlockStream::new(stream, addr);
                    v.encode(&mut block)?;
                }
                stream.write_word(&addr.to_le_bytes()[..ptr_size])
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(stream: &mut dyn Stream) -> Result<Self> {
        let ptr_size = stream.pointer_size();
        let addr_bytes = stream.read_word(ptr_size)?;
        let mut buf = [0u8; 8];
        buf[..ptr_size].copy_from_slice(&addr_bytes);
        let addr = u64::from_le_bytes(buf);
        if addr == 0 {
            return Ok(None);
        }
        let mut block = BlockStream::new(stream, addr);
        Ok(Some(T::decode(&mut block)?))
    }
}

/// A fixed-size array of guest values, encoded indirectly as a pointer to
/// `N` consecutive, naturally-aligned elements.
impl<T: EncodedSize + NaturalAlign, const N: usize> EncodedSize for [T; N] {
    fn encoded_size(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T: NaturalAlign, const N: usize> NaturalAlign for [T; N] {
    fn natural_align(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        let ptr_size = stream.pointer_size();
        let elem_align = T::natural_align(ptr_size);
        let elem_size = align_up(T::encoded_size(ptr_size), elem_align);
        let addr = stream.alloc(elem_size * N, elem_align)?;
        {
            let mut block = BlockStream::new(stream, addr);
            for item in self.iter() {
                item.encode(&mut block)?;
            }
        }
        stream.write_word(&addr.to_le_bytes()[..ptr_size])
    }
}

impl<T: Decode + Copy + Default, const N: usize> Decode for [T; N] {
    fn decode(stream: &mut dyn Stream) -> Result<Self> {
        let ptr_size = stream.pointer_size();
        let addr_bytes = stream.read_word(ptr_size)?;
        let mut buf = [0u8; 8];
        buf[..ptr_size].copy_from_slice(&addr_bytes);
        let addr = u64::from_le_bytes(buf);
        let mut block = BlockStream::new(stream, addr);
        let mut out = [T::default(); N];
        for slot in out.iter_mut() {
            *slot = T::decode(&mut block)?;
        }
        Ok(out)
    }
}

/// A guest-visible dynamic-length slice (§4.2: "a slice of size s writes s
/// elements in the sub-stream"). Unlike `[T; N]`, the element count isn't
/// known at the type level, so it is written as a leading `u64` inside the
/// same sub-stream ahead of the elements themselves, and read back from
/// there on decode - the argument slot still only ever costs one pointer
/// word, matching every other indirect field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSlice<T>(pub Vec<T>);

impl<T> From<Vec<T>> for GuestSlice<T> {
    fn from(v: Vec<T>) -> Self {
        GuestSlice(v)
    }
}

impl<T> EncodedSize for GuestSlice<T> {
    fn encoded_size(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T> NaturalAlign for GuestSlice<T> {
    fn natural_align(pointer_size: usize) -> usize {
        pointer_size
    }
}

impl<T: Encode> Encode for GuestSlice<T> {
    fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        let ptr_size = stream.pointer_size();
        let elem_align = T::natural_align(ptr_size).max(1);
        let elem_size = align_up(T::encoded_size(ptr_size), elem_align);
        let header = align_up(8, elem_align);
        let addr = stream.alloc(header + elem_size * self.0.len(), elem_align.max(8))?;
        stream.write_at(addr, &(self.0.len() as u64).to_le_bytes())?;
        {
            let mut block = BlockStream::new(stream, addr + header as u64);
            for item in self.0.iter() {
                item.encode(&mut block)?;
            }
        }
        stream.write_word(&addr.to_le_bytes()[..ptr_size])
    }
}

impl<T: Decode> Decode for GuestSlice<T> {
    fn decode(stream: &mut dyn Stream) -> Result<Self> {
        let ptr_size = stream.pointer_size();
        let addr_bytes = stream.read_word(ptr_size)?;
        let mut buf = [0u8; 8];
        buf[..ptr_size].copy_from_slice(&addr_bytes);
        let addr = u64::from_le_bytes(buf);
        if addr == 0 {
            return Ok(GuestSlice(Vec::new()));
        }
        let len_bytes = stream.read_at(addr, 8)?;
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&len_bytes);
        let len = u64::from_le_bytes(len_buf) as usize;

        let elem_align = T::natural_align(ptr_size).max(1);
        let header = align_up(8, elem_align);
        let mut block = BlockStream::new(stream, addr + header as u64);
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(&mut block)?);
        }
        Ok(GuestSlice(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;

    struct ArenaStream {
        pointer_size: usize,
        arena: Vec<u8>,
        words: Vec<Vec<u8>>,
    }

    impl ArenaStream {
        fn new(pointer_size: usize) -> Self {
            ArenaStream { pointer_size, arena: Vec::new(), words: Vec::new() }
        }
    }

    impl Stream for ArenaStream {
        fn pointer_size(&self) -> usize {
            self.pointer_size
        }
        fn write_word(&mut self, bytes: &[u8]) -> Result<()> {
            self.words.push(bytes.to_vec());
            Ok(())
        }
        fn read_word(&mut self, size: usize) -> Result<Vec<u8>> {
            Ok(self.words.remove(0)[..size].to_vec())
        }
        fn write_float_word(&mut self, bytes: &[u8]) -> Result<()> {
            self.write_word(bytes)
        }
        fn read_float_word(&mut self, size: usize) -> Result<Vec<u8>> {
            self.read_word(size)
        }
        fn alloc(&mut self, size: usize, align: usize) -> Result<u64> {
            let padded = (self.arena.len() + align - 1) & !(align - 1);
            self.arena.resize(padded, 0);
            let addr = self.arena.len() as u64;
            self.arena.resize(padded + size, 0);
            Ok(addr)
        }
        fn write_at(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
            let start = addr as usize;
            self.arena[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
            let start = addr as usize;
            Ok(self.arena[start..start + len].to_vec())
        }
    }

    #[test]
    fn roundtrips_primitive_scalars_and_bool() {
        let mut stream = ArenaStream::new(8);
        42i32.encode(&mut stream).unwrap();
        true.encode(&mut stream).unwrap();
        3.5f64.encode(&mut stream).unwrap();
        assert_eq!(i32::decode(&mut stream).unwrap(), 42);
        assert_eq!(bool::decode(&mut stream).unwrap(), true);
        assert_eq!(f64::decode(&mut stream).unwrap(), 3.5);
    }

    #[test]
    fn roundtrips_a_dynamic_slice() {
        let mut stream = ArenaStream::new(8);
        let value = GuestSlice(vec![1u32, 2, 3, 4, 5]);
        value.encode(&mut stream).unwrap();
        let decoded = GuestSlice::<u32>::decode(&mut stream).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_an_empty_slice() {
        let mut stream = ArenaStream::new(4);
        let value: GuestSlice<u8> = GuestSlice(Vec::new());
        value.encode(&mut stream).unwrap();
        let decoded = GuestSlice::<u8>::decode(&mut stream).unwrap();
        assert_eq!(decoded.0.len(), 0);
    }

    #[test]
    fn roundtrips_a_fixed_size_array() {
        let mut stream = ArenaStream::new(8);
        let value: [i32; 3] = [10, -20, 30];
        value.encode(&mut stream).unwrap();
        let decoded = <[i32; 3]>::decode(&mut stream).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_an_option_some_and_none() {
        let mut stream = ArenaStream::new(8);
        let some_val: Option<u32> = Some(99);
        let none_val: Option<u32> = None;
        some_val.encode(&mut stream).unwrap();
        none_val.encode(&mut stream).unwrap();
        assert_eq!(Option::<u32>::decode(&mut stream).unwrap(), Some(99));
        assert_eq!(Option::<u32>::decode(&mut stream).unwrap(), None);
    }

    #[test]
    fn roundtrips_a_string() {
        let mut stream = ArenaStream::new(8);
        let value = "hello guest".to_string();
        value.encode(&mut stream).unwrap();
        assert_eq!(String::decode(&mut stream).unwrap(), value);
    }
}
