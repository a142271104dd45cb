use std::fmt::{self, Debug};

use ahash::AHashMap;
use cid::Cid;

use crate::block::Block;
use crate::error::Error;

/// Priority of a wanted block.
pub type Priority = i32;

/// Represents a HAVE / DONT_HAVE for a given Cid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub typ: BlockPresenceType,
}

impl BlockPresence {
    /// Approximate size of a presence entry for `cid`, used as the work estimate of
    /// HAVE and DONT_HAVE responses.
    pub fn encoded_len_for_cid(cid: Cid) -> usize {
        cid.encoded_len() + 1
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

// A wantlist entry in a Bitswap message, with flags indicating
// - whether message is a cancel
// - whether requester wants a DONT_HAVE message
// - whether requester wants a HAVE message (instead of the block)
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("want_type", &self.want_type)
            .field("cancel", &self.cancel)
            .field("send_dont_have", &self.send_dont_have)
            .finish()
    }
}

impl Entry {
    pub fn want(cid: Cid, priority: Priority, want_type: WantType) -> Self {
        Entry {
            cid,
            priority,
            want_type,
            cancel: false,
            send_dont_have: true,
        }
    }

    pub fn cancel(cid: Cid) -> Self {
        Entry {
            cid,
            priority: 0,
            want_type: WantType::Block,
            cancel: true,
            send_dont_have: false,
        }
    }

    /// Validates the raw fields of a decoded wantlist entry.
    pub fn from_raw(
        cid: &[u8],
        priority: Priority,
        want_type: i32,
        cancel: bool,
        send_dont_have: bool,
    ) -> Result<Self, Error> {
        Ok(Entry {
            cid: Cid::try_from(cid)?,
            priority,
            want_type: WantType::try_from(want_type)?,
            cancel,
            send_dont_have,
        })
    }
}

/// A bitswap message.
///
/// Wantlist entries are kept in the order they were added, so that a receiver
/// can resolve conflicting entries for the same cid by the last one.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: Vec<Entry>,
    blocks: Vec<Block>,
    block_presences: AHashMap<Cid, BlockPresenceType>,
    pending_bytes: i32,
}

struct Fmt<F>(pub F)
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result;

impl<F> fmt::Debug for Fmt<F>
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field("wantlist", &self.wantlist)
            .field(
                "blocks",
                &Fmt(|f| {
                    let mut blocks = f.debug_list();
                    for block in &self.blocks {
                        blocks.entry(&block.cid.to_string());
                    }
                    blocks.finish()
                }),
            )
            .field(
                "block_presences",
                &Fmt(|f| {
                    let mut block_presences = f.debug_map();
                    for (cid, typ) in &self.block_presences {
                        block_presences.entry(&cid.to_string(), typ);
                    }
                    block_presences.finish()
                }),
            )
            .field("pending_bytes", &self.pending_bytes)
            .finish()
    }
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    pub fn full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.wantlist.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.iter()
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn block_presences(&self) -> impl Iterator<Item = BlockPresence> + '_ {
        self.block_presences.iter().map(|(cid, typ)| BlockPresence {
            cid: *cid,
            typ: *typ,
        })
    }

    pub fn haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::Have)
    }

    pub fn dont_haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::DontHave)
    }

    fn get_block_presence_by_type(&self, typ: BlockPresenceType) -> impl Iterator<Item = &Cid> {
        self.block_presences
            .iter()
            .filter_map(move |(cid, t)| (*t == typ).then_some(cid))
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    pub fn set_pending_bytes(&mut self, bytes: i32) {
        self.pending_bytes = bytes;
    }

    /// Appends a want for `cid`.
    pub fn add_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
    ) {
        self.wantlist.push(Entry {
            cid,
            priority,
            want_type,
            cancel: false,
            send_dont_have,
        });
    }

    /// Appends a cancel for `cid`.
    pub fn cancel(&mut self, cid: Cid) {
        self.wantlist.push(Entry::cancel(cid));
    }

    pub fn add_block(&mut self, block: Block) {
        if self.blocks.iter().any(|b| b.cid == block.cid) {
            return;
        }
        // a block supersedes any presence information
        self.block_presences.remove(&block.cid);
        self.blocks.push(block);
    }

    pub fn add_block_presence(&mut self, cid: Cid, typ: BlockPresenceType) {
        if self.blocks.iter().any(|b| b.cid == cid) {
            return;
        }
        self.block_presences.insert(cid, typ);
    }

    pub fn add_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::Have);
    }

    pub fn add_dont_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::DontHave);
    }
}
