//! B+-tree node variants and their byte encoding.
//!
//! A node record starts with a one-byte tag (1 = leaf, 2 = internal).
//! Leaves carry their sibling links and `(key, [rowid])` entries; internal
//! nodes carry keys and one more child id than keys. Node ids are
//! `(page_id, slot)` pairs; the null id is `(0, 0)`.

use std::fmt;

use crate::codec::{Codec, PageView, PageViewMut};
use crate::error::{Error, Result};
use crate::physical::{PageId, RowId};
use crate::schema::row::ValueCodec;
use crate::schema::{ColumnType, Value};

pub const LEAF_TAG: u8 = 1;
pub const INTERNAL_TAG: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub page: PageId,
    pub slot: u32,
}

impl NodeId {
    pub const NULL: NodeId = NodeId {
        page: PageId::NULL,
        slot: 0,
    };

    pub const ENCODED_LEN: usize = 12;

    pub fn new(page: PageId, slot: u32) -> Self {
        Self { page, slot }
    }

    pub fn is_null(self) -> bool {
        self.page.is_null() && self.slot == 0
    }

    fn read_at(view: &PageView, offset: usize) -> Result<NodeId> {
        Ok(NodeId {
            page: PageId(view.u64_at(offset)?),
            slot: view.u32_at(offset + 8)?,
        })
    }

    fn write_at(self, view: &mut PageViewMut, offset: usize) -> Result<()> {
        view.set_u64_at(offset, self.page.0)?;
        view.set_u32_at(offset + 8, self.slot)
    }

    fn read_opt_at(view: &PageView, offset: usize) -> Result<Option<NodeId>> {
        let id = Self::read_at(view, offset)?;
        Ok(if id.is_null() { None } else { Some(id) })
    }

    fn write_opt_at(id: Option<NodeId>, view: &mut PageViewMut, offset: usize) -> Result<()> {
        id.unwrap_or(NodeId::NULL).write_at(view, offset)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.slot)
    }
}

#[derive(Debug, Clone)]
pub struct KeyVals {
    pub key: Value,
    pub vals: Vec<RowId>,
}

#[derive(Debug, Clone)]
pub struct Leaf {
    pub id: NodeId,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub keyvals: Vec<KeyVals>,
}

#[derive(Debug, Clone)]
pub struct Internal {
    pub id: NodeId,
    pub keys: Vec<Value>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Leaf(leaf) => leaf.id,
            Node::Internal(internal) => internal.id,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Node::Leaf(_) => LEAF_TAG,
            Node::Internal(_) => INTERNAL_TAG,
        }
    }

    pub fn encoded_size(&self, key_ty: &ColumnType) -> usize {
        let key_codec = ValueCodec::new(key_ty.clone());
        match self {
            Node::Leaf(leaf) => {
                1 + 2 * NodeId::ENCODED_LEN
                    + leaf
                        .keyvals
                        .iter()
                        .map(|kv| {
                            key_codec.size_of(&kv.key)
                                + 4
                                + kv.vals.len() * RowId::ENCODED_LEN
                        })
                        .sum::<usize>()
            }
            Node::Internal(internal) => {
                1 + 4
                    + internal
                        .keys
                        .iter()
                        .map(|k| key_codec.size_of(k))
                        .sum::<usize>()
                    + internal.children.len() * NodeId::ENCODED_LEN
            }
        }
    }

    pub fn encode(&self, key_ty: &ColumnType) -> Result<Vec<u8>> {
        let key_codec = ValueCodec::new(key_ty.clone());
        let mut buf = vec![0u8; self.encoded_size(key_ty)];
        let mut view = PageViewMut::new(&mut buf);

        match self {
            Node::Leaf(leaf) => {
                view.set_u8_at(0, LEAF_TAG)?;
                NodeId::write_opt_at(leaf.prev, &mut view, 1)?;
                NodeId::write_opt_at(leaf.next, &mut view, 1 + NodeId::ENCODED_LEN)?;
                let mut pos = 1 + 2 * NodeId::ENCODED_LEN;
                for kv in &leaf.keyvals {
                    key_codec.write_at(&kv.key, &mut view, pos)?;
                    pos += key_codec.size_of(&kv.key);
                    view.set_u32_at(pos, kv.vals.len() as u32)?;
                    pos += 4;
                    for val in &kv.vals {
                        val.write_at(&mut view, pos)?;
                        pos += RowId::ENCODED_LEN;
                    }
                }
            }
            Node::Internal(internal) => {
                view.set_u8_at(0, INTERNAL_TAG)?;
                view.set_u32_at(1, internal.keys.len() as u32)?;
                let mut pos = 5;
                for key in &internal.keys {
                    key_codec.write_at(key, &mut view, pos)?;
                    pos += key_codec.size_of(key);
                }
                for child in &internal.children {
                    child.write_at(&mut view, pos)?;
                    pos += NodeId::ENCODED_LEN;
                }
            }
        }
        Ok(buf)
    }

    /// Decode a node record. The tag byte is peeked explicitly; anything
    /// other than a known tag fails `WrongNodeType`.
    pub fn decode(bytes: &[u8], key_ty: &ColumnType, id: NodeId) -> Result<Node> {
        let view = PageView::new(bytes);
        let key_codec = ValueCodec::new(key_ty.clone());

        match view.u8_at(0)? {
            LEAF_TAG => {
                let prev = NodeId::read_opt_at(&view, 1)?;
                let next = NodeId::read_opt_at(&view, 1 + NodeId::ENCODED_LEN)?;
                let mut keyvals = Vec::new();
                let mut pos = 1 + 2 * NodeId::ENCODED_LEN;
                while pos < bytes.len() {
                    let (key, consumed) = key_codec.read_at(&view, pos)?;
                    pos += consumed;
                    let count = view.u32_at(pos)? as usize;
                    pos += 4;
                    let mut vals = Vec::with_capacity(count);
                    for _ in 0..count {
                        vals.push(RowId::read_at(&view, pos)?);
                        pos += RowId::ENCODED_LEN;
                    }
                    keyvals.push(KeyVals { key, vals });
                }
                Ok(Node::Leaf(Leaf {
                    id,
                    prev,
                    next,
                    keyvals,
                }))
            }
            INTERNAL_TAG => {
                let key_count = view.u32_at(1)? as usize;
                let mut keys = Vec::with_capacity(key_count);
                let mut pos = 5;
                for _ in 0..key_count {
                    let (key, consumed) = key_codec.read_at(&view, pos)?;
                    keys.push(key);
                    pos += consumed;
                }
                let mut children = Vec::with_capacity(key_count + 1);
                while pos < bytes.len() {
                    children.push(NodeId::read_at(&view, pos)?);
                    pos += NodeId::ENCODED_LEN;
                }
                if children.len() != key_count + 1 {
                    return Err(Error::corrupt(format!(
                        "internal node with {} keys and {} children",
                        key_count,
                        children.len()
                    )));
                }
                Ok(Node::Internal(Internal { id, keys, children }))
            }
            found => Err(Error::WrongNodeType {
                found,
                expected: LEAF_TAG,
            }),
        }
    }
}
