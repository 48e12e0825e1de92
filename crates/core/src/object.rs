//! The object model and its canonical payload encoding.
//!
//! Exactly three payload kinds form the content-addressed DAG: [`Blob`] (one
//! chunk of file data), [`Inode`] (file metadata plus an ordered chunk list)
//! and [`Tree`] (directory metadata plus an ordered entry list). A fourth
//! frame type carries [`SnapshotMeta`], which lives outside the DAG in the
//! reserved snapshot key space and is not content-addressed.
//!
//! A payload is a frame byte followed by property records until EOF. Each
//! record is self-describing: a varint column count, then typed columns
//! (tag bytes first), so readers can skip tags they do not know. The
//! encoding is canonical (tree entries sorted by name, inode chunks sorted
//! by offset, scalar metadata in fixed schema order before any repeating
//! records), which makes the object identifier a pure function of semantic
//! content.

use magpie_crypto::Oid;

use crate::buf::{DecodeError, Reader};
use crate::varint::{decode_varint, decode_varint_signed, encode_varint, encode_varint_signed};

pub const FRAME_BLOB: u8 = 0x62;
pub const FRAME_INODE: u8 = 0x69;
pub const FRAME_SNAPSHOT: u8 = 0x73;
pub const FRAME_TREE: u8 = 0x74;

const COL_UINT: u8 = 0x01;
const COL_BYTES: u8 = 0x02;
const COL_SINT: u8 = 0x03;

/// Upper bound on columns per record; anything wider is malformed.
const MAX_COLS: u64 = 16;

/// The kind of a DAG object, as stored in the object cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Blob,
    Inode,
    Tree,
}

impl Kind {
    pub fn frame_byte(self) -> u8 {
        match self {
            Self::Blob => FRAME_BLOB,
            Self::Inode => FRAME_INODE,
            Self::Tree => FRAME_TREE,
        }
    }

    pub fn from_frame_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            FRAME_BLOB => Ok(Self::Blob),
            FRAME_INODE => Ok(Self::Inode),
            FRAME_TREE => Ok(Self::Tree),
            other => Err(DecodeError::UnknownFrame(other)),
        }
    }
}

/// One chunk of file contents. No outgoing references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub data: Vec<u8>,
}

/// A data chunk reference within an [`Inode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: u64,
    pub oid: Oid,
}

/// Metadata of a regular file plus its ordered chunk list.
///
/// An empty file has an empty chunk list; no zero-length blob is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub size: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ctime_ns: i64,
    pub mtime_ns: i64,
    pub chunks: Vec<ChunkRef>,
}

/// A directory entry within a [`Tree`].
///
/// `name` is the raw filename as bytes, since filenames are not required
/// to be UTF-8. The child is an inode or another tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: Vec<u8>,
    pub oid: Oid,
}

/// Metadata of a directory plus its ordered entry list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub entries: Vec<TreeEntry>,
}

/// A decoded DAG object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Inode(Inode),
    Tree(Tree),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Blob(_) => Kind::Blob,
            Self::Inode(_) => Kind::Inode,
            Self::Tree(_) => Kind::Tree,
        }
    }

    /// The outgoing references of this object, in payload order.
    pub fn child_oids(&self) -> Vec<Oid> {
        match self {
            Self::Blob(_) => Vec::new(),
            Self::Inode(inode) => inode.chunks.iter().map(|c| c.oid).collect(),
            Self::Tree(tree) => tree.entries.iter().map(|e| e.oid).collect(),
        }
    }

    /// The canonical plaintext payload. The object identifier is the keyed
    /// MAC of exactly these bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Blob(blob) => blob.encode(),
            Self::Inode(inode) => inode.encode(),
            Self::Tree(tree) => tree.encode(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        match Kind::from_frame_byte(r.get_u8()?)? {
            Kind::Blob => Blob::decode_records(&mut r).map(Self::Blob),
            Kind::Inode => Inode::decode_records(&mut r).map(Self::Inode),
            Kind::Tree => Tree::decode_records(&mut r).map(Self::Tree),
        }
    }
}

impl Blob {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 8);
        out.push(FRAME_BLOB);
        put_record_bytes(&mut out, b"d", &self.data);
        out
    }

    fn decode_records(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut data = None;
        while !r.is_empty() {
            let (tag, cols) = read_record(r)?;
            match (tag, cols.as_slice()) {
                (b"d", [Col::Bytes(bytes)]) => {
                    if data.replace(bytes.to_vec()).is_some() {
                        return Err(DecodeError::Malformed("duplicate blob data record"));
                    }
                }
                (b"d", _) => return Err(DecodeError::Malformed("blob data has wrong shape")),
                _ => {} // unknown tag: skip for forward compatibility
            }
        }
        let data = data.ok_or(DecodeError::Malformed("blob without data record"))?;
        Ok(Self { data })
    }
}

impl Inode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.chunks.len() * 40);
        out.push(FRAME_INODE);
        put_record_uint(&mut out, b"s", self.size);
        put_record_uint(&mut out, b"i", self.ino);
        put_record_uint(&mut out, b"u", self.uid.into());
        put_record_uint(&mut out, b"g", self.gid.into());
        put_record_uint(&mut out, b"m", self.mode.into());
        put_record_sint(&mut out, b"ct", self.ctime_ns);
        put_record_sint(&mut out, b"mt", self.mtime_ns);

        let mut chunks = self.chunks.clone();
        chunks.sort_by_key(|c| c.offset);
        for chunk in &chunks {
            put_record_chunk(&mut out, chunk);
        }
        out
    }

    fn decode_records(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut inode = Self {
            size: 0,
            ino: 0,
            uid: 0,
            gid: 0,
            mode: 0,
            ctime_ns: 0,
            mtime_ns: 0,
            chunks: Vec::new(),
        };
        while !r.is_empty() {
            let (tag, cols) = read_record(r)?;
            match (tag, cols.as_slice()) {
                (b"s", [Col::Uint(v)]) => inode.size = *v,
                (b"i", [Col::Uint(v)]) => inode.ino = *v,
                (b"u", [Col::Uint(v)]) => inode.uid = narrow(*v)?,
                (b"g", [Col::Uint(v)]) => inode.gid = narrow(*v)?,
                (b"m", [Col::Uint(v)]) => inode.mode = narrow(*v)?,
                (b"ct", [Col::Sint(v)]) => inode.ctime_ns = *v,
                (b"mt", [Col::Sint(v)]) => inode.mtime_ns = *v,
                (b"d", [Col::Uint(offset), Col::Bytes(oid)]) => inode.chunks.push(ChunkRef {
                    offset: *offset,
                    oid: oid_from(oid)?,
                }),
                (b"s" | b"i" | b"u" | b"g" | b"m" | b"ct" | b"mt" | b"d", _) => {
                    return Err(DecodeError::Malformed("inode record has wrong shape"))
                }
                _ => {}
            }
        }
        Ok(inode)
    }
}

impl Tree {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.entries.len() * 48);
        out.push(FRAME_TREE);
        put_record_uint(&mut out, b"u", self.uid.into());
        put_record_uint(&mut out, b"g", self.gid.into());
        put_record_uint(&mut out, b"m", self.mode.into());

        let mut entries: Vec<&TreeEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            put_record_entry(&mut out, entry);
        }
        out
    }

    fn decode_records(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut tree = Self {
            uid: 0,
            gid: 0,
            mode: 0,
            entries: Vec::new(),
        };
        while !r.is_empty() {
            let (tag, cols) = read_record(r)?;
            match (tag, cols.as_slice()) {
                (b"u", [Col::Uint(v)]) => tree.uid = narrow(*v)?,
                (b"g", [Col::Uint(v)]) => tree.gid = narrow(*v)?,
                (b"m", [Col::Uint(v)]) => tree.mode = narrow(*v)?,
                (b"e", [Col::Bytes(name), Col::Bytes(oid)]) => tree.entries.push(TreeEntry {
                    name: name.to_vec(),
                    oid: oid_from(oid)?,
                }),
                (b"u" | b"g" | b"m" | b"e", _) => {
                    return Err(DecodeError::Malformed("tree record has wrong shape"))
                }
                _ => {}
            }
        }
        Ok(tree)
    }
}

/// Snapshot metadata: a named root, not part of the content-addressed DAG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub name: String,
    pub root: Oid,
    pub created_at_ns: i64,
}

impl SnapshotMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.name.len());
        out.push(FRAME_SNAPSHOT);
        put_record_bytes(&mut out, b"n", self.name.as_bytes());
        put_record_bytes(&mut out, b"r", self.root.as_bytes());
        put_record_sint(&mut out, b"t", self.created_at_ns);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        if r.get_u8()? != FRAME_SNAPSHOT {
            return Err(DecodeError::Malformed("not a snapshot frame"));
        }

        let mut name = None;
        let mut root = None;
        let mut created_at_ns = 0;
        while !r.is_empty() {
            let (tag, cols) = read_record(&mut r)?;
            match (tag, cols.as_slice()) {
                (b"n", [Col::Bytes(bytes)]) => {
                    let s = std::str::from_utf8(bytes)
                        .map_err(|_| DecodeError::Malformed("snapshot name is not UTF-8"))?;
                    name = Some(s.to_owned());
                }
                (b"r", [Col::Bytes(oid)]) => root = Some(oid_from(oid)?),
                (b"t", [Col::Sint(v)]) => created_at_ns = *v,
                (b"n" | b"r" | b"t", _) => {
                    return Err(DecodeError::Malformed("snapshot record has wrong shape"))
                }
                _ => {}
            }
        }
        Ok(Self {
            name: name.ok_or(DecodeError::Malformed("snapshot without name"))?,
            root: root.ok_or(DecodeError::Malformed("snapshot without root"))?,
            created_at_ns,
        })
    }
}

enum Col<'a> {
    Uint(u64),
    Sint(i64),
    Bytes(&'a [u8]),
}

fn read_record<'a>(r: &mut Reader<'a>) -> Result<(&'a [u8], Vec<Col<'a>>), DecodeError> {
    let ncols = decode_varint(r)?;
    if ncols == 0 || ncols > MAX_COLS {
        return Err(DecodeError::Malformed("record column count out of range"));
    }

    let tag = match read_col(r)? {
        Col::Bytes(tag) => tag,
        _ => return Err(DecodeError::Malformed("record tag is not a byte string")),
    };
    let cols = (1..ncols).map(|_| read_col(r)).collect::<Result<_, _>>()?;
    Ok((tag, cols))
}

fn read_col<'a>(r: &mut Reader<'a>) -> Result<Col<'a>, DecodeError> {
    match r.get_u8()? {
        COL_UINT => decode_varint(r).map(Col::Uint),
        COL_SINT => decode_varint_signed(r).map(Col::Sint),
        COL_BYTES => {
            let len = decode_varint(r)?;
            let len = usize::try_from(len).map_err(|_| DecodeError::Eof)?;
            r.get_slice(len).map(Col::Bytes)
        }
        other => Err(DecodeError::UnknownColumn(other)),
    }
}

fn put_record_uint(out: &mut Vec<u8>, tag: &[u8], value: u64) {
    encode_varint(2, out);
    put_col_bytes(out, tag);
    out.push(COL_UINT);
    encode_varint(value, out);
}

fn put_record_sint(out: &mut Vec<u8>, tag: &[u8], value: i64) {
    encode_varint(2, out);
    put_col_bytes(out, tag);
    out.push(COL_SINT);
    encode_varint_signed(value, out);
}

fn put_record_bytes(out: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    encode_varint(2, out);
    put_col_bytes(out, tag);
    put_col_bytes(out, value);
}

fn put_record_entry(out: &mut Vec<u8>, entry: &TreeEntry) {
    encode_varint(3, out);
    put_col_bytes(out, b"e");
    put_col_bytes(out, &entry.name);
    put_col_bytes(out, entry.oid.as_bytes());
}

fn put_record_chunk(out: &mut Vec<u8>, chunk: &ChunkRef) {
    encode_varint(3, out);
    put_col_bytes(out, b"d");
    out.push(COL_UINT);
    encode_varint(chunk.offset, out);
    put_col_bytes(out, chunk.oid.as_bytes());
}

fn put_col_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(COL_BYTES);
    encode_varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn oid_from(bytes: &[u8]) -> Result<Oid, DecodeError> {
    Oid::from_slice(bytes).map_err(|_| DecodeError::Malformed("reference is not a valid oid"))
}

fn narrow(v: u64) -> Result<u32, DecodeError> {
    u32::try_from(v).map_err(|_| DecodeError::Malformed("value exceeds 32 bits"))
}
