//! Image loading: reconstructs the initial object graph from a serialized
//! record stream and hands back the globals bundle.
//!
//! The stream is a flat sequence of tagged records over a sliding cursor.
//! Ordinary and byte objects enter an indirect table *before* their class
//! and fields are read, so self-referential graphs reload; later records
//! reference earlier objects by table index. Word sizes use a byte-sum
//! encoding (`0xFF` means add-and-continue); inline integer payloads are
//! four raw native-endian bytes, which is what makes images non-portable
//! across endianness.

use core::fmt;
use std::io;
use std::path::Path;

use heap::{HeapError, MemoryManager, RootProvider};
use object::{Globals, RawObject, Value};

const IMAGE_MAGIC: &[u8; 8] = b"LSTIMAGE";
const IMAGE_VERSION: u32 = 1;

/// Header bytes before the record stream: magic plus a version word.
pub const IMAGE_HEADER_LEN: usize = IMAGE_MAGIC.len() + 4;

// Record tags.
const TAG_ORDINARY: usize = 1;
const TAG_INLINE_INTEGER: usize = 2;
const TAG_BYTE: usize = 3;
const TAG_PREVIOUS: usize = 4;
const TAG_NIL: usize = 5;

/// The globals records at the tail of every image, in stream order.
const ROOT_COUNT: usize = 15;

#[derive(Debug)]
pub enum ImageError {
    Io(io::Error),
    BadMagic,
    UnsupportedVersion(u32),
    Truncated { offset: usize },
    BadRecord { offset: usize, tag: usize },
    BadIndirect { offset: usize, index: usize },
    IntegerRange { offset: usize, value: i64 },
    Heap(HeapError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "image unreadable: {err}"),
            Self::BadMagic => write!(f, "not an image file"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported image version {version}")
            }
            Self::Truncated { offset } => {
                write!(f, "image truncated at byte {offset}")
            }
            Self::BadRecord { offset, tag } => {
                write!(f, "unknown record tag {tag} at byte {offset}")
            }
            Self::BadIndirect { offset, index } => {
                write!(f, "dangling object index {index} at byte {offset}")
            }
            Self::IntegerRange { offset, value } => {
                write!(f, "inline integer {value} out of range at byte {offset}")
            }
            Self::Heap(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<HeapError> for ImageError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

/// Record cursor plus the two root sets that keep a half-loaded graph
/// alive across collections triggered by loader allocations.
struct Loader<'a> {
    data: &'a [u8],
    pos: usize,
    indirects: Vec<Value>,
    sequence: Vec<Value>,
}

impl RootProvider for Loader<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.indirects {
            visitor(value);
        }
        for value in &mut self.sequence {
            visitor(value);
        }
    }
}

impl<'a> Loader<'a> {
    fn read_byte(&mut self) -> Result<u8, ImageError> {
        let byte = self
            .data
            .get(self.pos)
            .copied()
            .ok_or(ImageError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Byte-sum word encoding: accumulate until a byte below `0xFF`.
    fn read_word(&mut self) -> Result<usize, ImageError> {
        let mut total = 0usize;
        loop {
            let byte = self.read_byte()?;
            total += byte as usize;
            if byte != 0xFF {
                return Ok(total);
            }
        }
    }

    /// Four raw native-endian bytes.
    fn read_i32(&mut self) -> Result<i32, ImageError> {
        if self.pos + 4 > self.data.len() {
            return Err(ImageError::Truncated { offset: self.data.len() });
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(i32::from_ne_bytes(raw))
    }

    fn read_object<M: MemoryManager>(
        &mut self,
        heap: &mut M,
    ) -> Result<Value, ImageError> {
        let offset = self.pos;
        let tag = self.read_word()?;
        match tag {
            TAG_ORDINARY => {
                let size = self.read_word()?;
                // Class unknown until its record is read below; the null
                // class word is skipped by the collector meanwhile.
                let object =
                    heap.allocate_ordinary(Value::NULL, size, self)?;
                let index = self.indirects.len();
                self.indirects.push(object);

                let class = self.read_object(heap)?;
                // SAFETY: the indirect table tracked any relocation; the
                // class word store is barriered.
                unsafe {
                    heap.store_class(self.indirects[index], class);
                }
                for field in 0..size {
                    let value = self.read_object(heap)?;
                    // SAFETY: `field` < the recorded object size.
                    unsafe {
                        heap.store_slot(self.indirects[index], field, value);
                    }
                }
                Ok(self.indirects[index])
            }

            TAG_BYTE => {
                let size = self.read_word()?;
                let object = heap.allocate_binary(Value::NULL, size, self)?;
                let index = self.indirects.len();
                self.indirects.push(object);

                if self.pos + size > self.data.len() {
                    return Err(ImageError::Truncated {
                        offset: self.data.len(),
                    });
                }
                // SAFETY: freshly allocated binary object of exactly `size`
                // bytes; no allocation separates it from this write.
                unsafe {
                    let mut object = self.indirects[index];
                    object
                        .as_obj_mut::<RawObject>()
                        .bytes_mut()
                        .copy_from_slice(&self.data[self.pos..self.pos + size]);
                }
                self.pos += size;

                let class = self.read_object(heap)?;
                // SAFETY: as above.
                unsafe {
                    heap.store_class(self.indirects[index], class);
                }
                Ok(self.indirects[index])
            }

            TAG_INLINE_INTEGER => {
                let value = self.read_i32()?;
                if !Value::fits_small_integer(value as i64) {
                    return Err(ImageError::IntegerRange {
                        offset,
                        value: value as i64,
                    });
                }
                Ok(Value::from_i32(value))
            }

            TAG_PREVIOUS => {
                let index = self.read_word()?;
                self.indirects.get(index).copied().ok_or(
                    ImageError::BadIndirect { offset, index },
                )
            }

            TAG_NIL => self
                .indirects
                .first()
                .copied()
                .ok_or(ImageError::BadIndirect { offset, index: 0 }),

            tag => Err(ImageError::BadRecord { offset, tag }),
        }
    }

    fn read_root<M: MemoryManager>(
        &mut self,
        heap: &mut M,
    ) -> Result<(), ImageError> {
        let value = self.read_object(heap)?;
        self.sequence.push(value);
        Ok(())
    }
}

/// Parse an in-memory image into `heap` and assemble the globals.
///
/// Stream order after the header: nil, true, false, the globals dictionary,
/// the classes (SmallInt, Array, Block, Context, String, Integer), the
/// initial method, the three binary selectors (`<`, `<=`, `+`), and the
/// `doesNotUnderstand:` symbol.
pub fn parse_image<M: MemoryManager>(
    heap: &mut M,
    data: &[u8],
) -> Result<Box<Globals>, ImageError> {
    if data.len() < IMAGE_HEADER_LEN {
        return Err(ImageError::BadMagic);
    }
    if &data[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&data[IMAGE_MAGIC.len()..IMAGE_HEADER_LEN]);
    let version = u32::from_ne_bytes(version);
    if version != IMAGE_VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let mut loader = Loader {
        data,
        pos: IMAGE_HEADER_LEN,
        indirects: Vec::new(),
        sequence: Vec::new(),
    };
    for _ in 0..ROOT_COUNT {
        loader.read_root(heap)?;
    }

    tracing::debug!(
        target: "image",
        objects = loader.indirects.len(),
        bytes = loader.pos,
        "image loaded"
    );

    let roots = &loader.sequence;
    Ok(Box::new(Globals {
        nil: roots[0],
        true_obj: roots[1],
        false_obj: roots[2],
        globals_dictionary: roots[3],
        small_int_class: roots[4],
        array_class: roots[5],
        block_class: roots[6],
        context_class: roots[7],
        string_class: roots[8],
        integer_class: roots[9],
        initial_method: roots[10],
        binary_selectors: [roots[11], roots[12], roots[13]],
        bad_method_symbol: roots[14],
    }))
}

/// Read and parse an image file. The file is fully consumed before
/// interpretation begins; no further I/O is required by the core.
pub fn load_image<M: MemoryManager>(
    heap: &mut M,
    path: &Path,
) -> Result<Box<Globals>, ImageError> {
    let data = std::fs::read(path)?;
    parse_image(heap, &data)
}
