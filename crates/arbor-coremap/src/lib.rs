//! Flat, priority-decoded address map backing the simulated bus fabric.
//!
//! # Design
//!
//! Every byte-addressed access in the simulation resolves through one of
//! three *views* (read, write, execute). An attachment names the views it
//! participates in, so a region can be readable out of raw backing storage
//! while writes to the same range decode to a different target or nowhere at
//! all. Privileged writers (firmware loaders, debug stores) resolve the
//! **read** view and mutate its backing storage directly.
//!
//! Within one decode class, attachments in a view must be disjoint; a lookup
//! tries normal attachments first and falls back to a subtractive attachment
//! only when no normal one matches. An address matching neither is a master
//! abort, reported to the caller as a short transfer count.
//!
//! The map is generic over the pass-through target handle `T` so it carries
//! no knowledge of the device layer that instantiates it.

use bitflags::bitflags;
use thiserror::Error;

/// Numeric id of an address space (bus-specific meaning).
pub type AddressSpace = u32;

bitflags! {
    /// Access policy bits; each set bit enrolls an attachment in that view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Access {
    pub const RW: Access = Access::READ.union(Access::WRITE);
    pub const RWX: Access = Access::RW.union(Access::EXEC);
}

/// Decode priority class of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// Positive decode: claims exactly its address range.
    Normal,
    /// Claims whatever no normal attachment does.
    Subtractive,
}

/// Handle to raw backing storage owned by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

/// What an attachment decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<T> {
    /// Raw bytes owned by the map; accesses never leave it.
    Block(BlockId),
    /// Pass-through to a device; the bus layer dispatches the access.
    Device(T),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error(
        "attachment {space:#x}:{addr:#x}+{len:#x} overlaps existing \
         {other_addr:#x}+{other_len:#x} in the {view} view"
    )]
    Overlap {
        space: AddressSpace,
        addr: u64,
        len: u64,
        other_addr: u64,
        other_len: u64,
        view: &'static str,
    },

    #[error("zero-length attachment at {space:#x}:{addr:#x}")]
    EmptyRange { space: AddressSpace, addr: u64 },

    #[error("attachment {space:#x}:{addr:#x}+{len:#x} wraps past the end of the address space")]
    EndOverflow {
        space: AddressSpace,
        addr: u64,
        len: u64,
    },

    #[error("attachment with no access views at {space:#x}:{addr:#x}")]
    NoViews { space: AddressSpace, addr: u64 },

    #[error("backing block of {len:#x} bytes does not fit host memory")]
    BlockTooLarge { len: u64 },

    #[error("no attachment {space:#x}:{addr:#x}+{len:#x} to detach in the {view} view")]
    NoSuchAttachment {
        space: AddressSpace,
        addr: u64,
        len: u64,
        view: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, MapError>;

#[derive(Debug, Clone, Copy)]
struct Mapping<T> {
    space: AddressSpace,
    addr: u64,
    len: u64,
    target: Target<T>,
}

impl<T> Mapping<T> {
    fn end(&self) -> u64 {
        // Validated against overflow on attach.
        self.addr + self.len
    }

    fn contains(&self, space: AddressSpace, addr: u64) -> bool {
        self.space == space && addr >= self.addr && addr < self.end()
    }
}

/// A resolved lookup: the matched attachment and its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub target: Target<T>,
    /// Start address of the matched attachment.
    pub base: u64,
    /// Length of the matched attachment.
    pub len: u64,
}

struct View<T> {
    name: &'static str,
    // Sorted by (space, addr); disjoint within a space.
    normal: Vec<Mapping<T>>,
    // Checked in attach order; first hit wins.
    subtractive: Vec<Mapping<T>>,
}

impl<T: Copy> View<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            normal: Vec::new(),
            subtractive: Vec::new(),
        }
    }

    fn check(&self, kind: DecodeKind, mapping: &Mapping<T>) -> Result<()> {
        if kind == DecodeKind::Subtractive {
            return Ok(());
        }
        let idx = self
            .normal
            .partition_point(|m| (m.space, m.addr) < (mapping.space, mapping.addr));
        for neighbor in [idx.checked_sub(1), Some(idx)].into_iter().flatten() {
            let Some(other) = self.normal.get(neighbor) else {
                continue;
            };
            if other.space == mapping.space
                && mapping.addr < other.end()
                && other.addr < mapping.end()
            {
                return Err(MapError::Overlap {
                    space: mapping.space,
                    addr: mapping.addr,
                    len: mapping.len,
                    other_addr: other.addr,
                    other_len: other.len,
                    view: self.name,
                });
            }
        }
        Ok(())
    }

    fn attach(&mut self, kind: DecodeKind, mapping: Mapping<T>) {
        match kind {
            DecodeKind::Normal => {
                let idx = self
                    .normal
                    .partition_point(|m| (m.space, m.addr) < (mapping.space, mapping.addr));
                self.normal.insert(idx, mapping);
            }
            DecodeKind::Subtractive => {
                // Subtractive ranges may shadow each other; first attached wins.
                self.subtractive.push(mapping);
            }
        }
    }

    fn find_exact(&self, kind: DecodeKind, space: AddressSpace, addr: u64, len: u64) -> Result<()> {
        let list = match kind {
            DecodeKind::Normal => &self.normal,
            DecodeKind::Subtractive => &self.subtractive,
        };
        if list
            .iter()
            .any(|m| m.space == space && m.addr == addr && m.len == len)
        {
            Ok(())
        } else {
            Err(MapError::NoSuchAttachment {
                space,
                addr,
                len,
                view: self.name,
            })
        }
    }

    fn detach(&mut self, kind: DecodeKind, space: AddressSpace, addr: u64, len: u64) -> Result<()> {
        let list = match kind {
            DecodeKind::Normal => &mut self.normal,
            DecodeKind::Subtractive => &mut self.subtractive,
        };
        match list
            .iter()
            .position(|m| m.space == space && m.addr == addr && m.len == len)
        {
            Some(idx) => {
                list.remove(idx);
                Ok(())
            }
            None => Err(MapError::NoSuchAttachment {
                space,
                addr,
                len,
                view: self.name,
            }),
        }
    }

    fn resolve(&self, space: AddressSpace, addr: u64) -> Option<&Mapping<T>> {
        let idx = self
            .normal
            .partition_point(|m| (m.space, m.addr) <= (space, addr));
        if let Some(mapping) = idx.checked_sub(1).and_then(|i| self.normal.get(i)) {
            if mapping.contains(space, addr) {
                return Some(mapping);
            }
        }
        self.subtractive.iter().find(|m| m.contains(space, addr))
    }
}

/// The core memory map: three views plus the raw blocks they decode into.
pub struct CoreMap<T> {
    read: View<T>,
    write: View<T>,
    exec: View<T>,
    blocks: Vec<Box<[u8]>>,
}

impl<T: Copy> CoreMap<T> {
    pub fn new() -> Self {
        Self {
            read: View::new("read"),
            write: View::new("write"),
            exec: View::new("exec"),
            blocks: Vec::new(),
        }
    }

    fn views(&self, access: Access) -> Vec<&View<T>> {
        let mut views = Vec::new();
        if access.contains(Access::READ) {
            views.push(&self.read);
        }
        if access.contains(Access::WRITE) {
            views.push(&self.write);
        }
        if access.contains(Access::EXEC) {
            views.push(&self.exec);
        }
        views
    }

    fn views_mut(&mut self, access: Access) -> Vec<&mut View<T>> {
        let mut views = Vec::new();
        let Self {
            read, write, exec, ..
        } = self;
        if access.contains(Access::READ) {
            views.push(read);
        }
        if access.contains(Access::WRITE) {
            views.push(write);
        }
        if access.contains(Access::EXEC) {
            views.push(exec);
        }
        views
    }

    fn check_range(space: AddressSpace, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(MapError::EmptyRange { space, addr });
        }
        if addr.checked_add(len).is_none() {
            return Err(MapError::EndOverflow { space, addr, len });
        }
        Ok(())
    }

    /// Attaches `target` over `[addr, addr+len)` of `space` in every view
    /// named by `access`.
    ///
    /// Either all named views accept the range or none do.
    pub fn attach(
        &mut self,
        kind: DecodeKind,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
        target: Target<T>,
    ) -> Result<()> {
        Self::check_range(space, addr, len)?;
        if access.is_empty() {
            return Err(MapError::NoViews { space, addr });
        }

        let mapping = Mapping {
            space,
            addr,
            len,
            target,
        };

        // Validate every view before touching any, so a failed attach leaves
        // the map unchanged.
        for view in self.views(access) {
            view.check(kind, &mapping)?;
        }
        for view in self.views_mut(access) {
            view.attach(kind, mapping);
        }
        Ok(())
    }

    /// Allocates a zeroed backing block of `len` bytes and attaches it as a
    /// normal-decode range.
    pub fn attach_ram(
        &mut self,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<BlockId> {
        Self::check_range(space, addr, len)?;
        let size = usize::try_from(len).map_err(|_| MapError::BlockTooLarge { len })?;
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block count fits u32"));
        self.blocks.push(vec![0u8; size].into_boxed_slice());
        match self.attach(DecodeKind::Normal, space, addr, len, access, Target::Block(id)) {
            Ok(()) => Ok(id),
            Err(err) => {
                self.blocks.pop();
                Err(err)
            }
        }
    }

    /// Removes an attachment previously made with identical parameters.
    pub fn detach(
        &mut self,
        kind: DecodeKind,
        space: AddressSpace,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<()> {
        // Two passes for the same reason as `attach`: all views or none.
        for view in self.views(access) {
            view.find_exact(kind, space, addr, len)?;
        }
        for view in self.views_mut(access) {
            view.detach(kind, space, addr, len)
                .expect("presence validated above");
        }
        Ok(())
    }

    /// Drops every attachment and backing block (full re-initialization).
    pub fn clear(&mut self) {
        for view in [&mut self.read, &mut self.write, &mut self.exec] {
            view.normal.clear();
            view.subtractive.clear();
        }
        self.blocks.clear();
    }

    pub fn block(&self, id: BlockId) -> &[u8] {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut [u8] {
        &mut self.blocks[id.0 as usize]
    }

    fn view(&self, access: Access) -> &View<T> {
        match access {
            Access::READ => &self.read,
            Access::WRITE => &self.write,
            Access::EXEC => &self.exec,
            _ => panic!("lookup view must name exactly one access kind"),
        }
    }

    /// Finds the attachment covering `addr` in the view named by `access`
    /// (exactly one of `READ`/`WRITE`/`EXEC`). `None` is a master abort.
    pub fn resolve(&self, access: Access, space: AddressSpace, addr: u64) -> Option<Resolved<T>> {
        self.view(access).resolve(space, addr).map(|m| Resolved {
            target: m.target,
            base: m.addr,
            len: m.len,
        })
    }

}

impl<T: Copy> Default for CoreMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
