//! GGUF model file inspection
//!
//! Reads just enough of a GGUF file to reject obviously wrong input (an
//! HTML error page saved as `qwen.gguf`, a truncated download) before
//! llama.cpp gets to it, and to pull out the model name for status output.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;
// magic + version + tensor_count + kv_count
const HEADER_SIZE: u64 = 4 + 4 + 8 + 8;
const MAX_KEY_LEN: u64 = 64 * 1024;
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_ARRAY_DEPTH: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

impl GgufHeader {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(anyhow!("File does not exist: {:?}", path));
        }
        let file_size = std::fs::metadata(path)?.len();
        if file_size < HEADER_SIZE {
            return Err(anyhow!(
                "File too small for valid GGUF: {} < {}",
                file_size,
                HEADER_SIZE
            ));
        }
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != GGUF_MAGIC {
            return Err(anyhow!("Invalid GGUF magic number: {:?}", magic));
        }

        let version = read_u32(reader)?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(anyhow!("Unsupported GGUF version: {}", version));
        }

        let tensor_count = read_u64(reader)?;
        if tensor_count == 0 {
            return Err(anyhow!("Invalid tensor count: 0"));
        }
        let kv_count = read_u64(reader)?;

        Ok(Self {
            version,
            tensor_count,
            kv_count,
        })
    }
}

/// A decoded metadata value. Arrays are summarised, not materialised.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Array { elem_type: u32, len: u64 },
}

impl fmt::Display for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::UInt(v) => write!(f, "{}", v),
            GgufValue::Int(v) => write!(f, "{}", v),
            GgufValue::Float(v) => write!(f, "{}", v),
            GgufValue::Bool(v) => write!(f, "{}", v),
            GgufValue::Str(v) => write!(f, "{}", v),
            GgufValue::Array { elem_type, len } => {
                write!(f, "[{} x type {}]", len, elem_type)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GgufMetadata {
    pub header: GgufHeader,
    pub file_size: u64,
    pub entries: Vec<(String, GgufValue)>,
}

impl GgufMetadata {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(GgufValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("general.name")
    }

    pub fn architecture(&self) -> Option<&str> {
        self.get_str("general.architecture")
    }
}

/// Read the header and all metadata key/value pairs of a GGUF file.
pub fn inspect<P: AsRef<Path>>(path: P) -> Result<GgufMetadata> {
    let path = path.as_ref();
    let header = GgufHeader::read(path)?;
    let file_size = std::fs::metadata(path)?.len();

    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(HEADER_SIZE))?;

    let mut entries = Vec::with_capacity(header.kv_count.min(1024) as usize);
    for i in 0..header.kv_count {
        let key_len = read_u64(&mut reader)?;
        if key_len > MAX_KEY_LEN {
            return Err(anyhow!("Key length too large: {}", key_len));
        }
        let key = read_string(&mut reader, key_len)
            .with_context(|| format!("Failed to read metadata key #{}", i))?;
        let value_type = read_u32(&mut reader)?;
        let value = read_value(&mut reader, value_type)
            .with_context(|| format!("Failed to read metadata value for {}", key))?;
        entries.push((key, value));
    }

    Ok(GgufMetadata {
        header,
        file_size,
        entries,
    })
}

fn read_value<R: Read + Seek>(reader: &mut BufReader<R>, value_type: u32) -> Result<GgufValue> {
    let value = match value_type {
        0 => GgufValue::UInt(read_array::<1, _>(reader)?[0] as u64),
        1 => GgufValue::Int(read_array::<1, _>(reader)?[0] as i8 as i64),
        2 => GgufValue::UInt(u16::from_le_bytes(read_array(reader)?) as u64),
        3 => GgufValue::Int(i16::from_le_bytes(read_array(reader)?) as i64),
        4 => GgufValue::UInt(read_u32(reader)? as u64),
        5 => GgufValue::Int(i32::from_le_bytes(read_array(reader)?) as i64),
        6 => GgufValue::Float(f32::from_le_bytes(read_array(reader)?) as f64),
        7 => GgufValue::Bool(read_array::<1, _>(reader)?[0] != 0),
        8 => {
            let len = read_u64(reader)?;
            GgufValue::Str(read_string(reader, len)?)
        }
        9 => {
            let elem_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            skip_array(reader, elem_type, len, 0)?;
            GgufValue::Array { elem_type, len }
        }
        10 => GgufValue::UInt(read_u64(reader)?),
        11 => GgufValue::Int(i64::from_le_bytes(read_array(reader)?)),
        12 => GgufValue::Float(f64::from_le_bytes(read_array(reader)?)),
        other => return Err(anyhow!("Unknown value type: {}", other)),
    };
    Ok(value)
}

// Vocabulary arrays hold ~150k strings, so skips stay inside the read buffer.
fn skip_array<R: Read + Seek>(
    reader: &mut BufReader<R>,
    elem_type: u32,
    len: u64,
    depth: u32,
) -> Result<()> {
    let width: u64 = match elem_type {
        0 | 1 | 7 => 1,
        2 | 3 => 2,
        4 | 5 | 6 => 4,
        10..=12 => 8,
        8 => {
            for _ in 0..len {
                let str_len = read_u64(reader)?;
                if str_len > MAX_STRING_LEN {
                    return Err(anyhow!("String value too large: {}", str_len));
                }
                reader.seek_relative(str_len as i64)?;
            }
            return Ok(());
        }
        9 => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(anyhow!("Arrays nested deeper than {}", MAX_ARRAY_DEPTH));
            }
            for _ in 0..len {
                let inner_type = read_u32(reader)?;
                let inner_len = read_u64(reader)?;
                skip_array(reader, inner_type, inner_len, depth + 1)?;
            }
            return Ok(());
        }
        other => return Err(anyhow!("Unsupported array element type: {}", other)),
    };
    let bytes = width
        .checked_mul(len)
        .filter(|b| *b <= i64::MAX as u64)
        .ok_or_else(|| anyhow!("Array length overflow: {}", len))?;
    reader.seek_relative(bytes as i64)?;
    Ok(())
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R, len: u64) -> Result<String> {
    if len > MAX_STRING_LEN {
        return Err(anyhow!("String value too large: {}", len));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
