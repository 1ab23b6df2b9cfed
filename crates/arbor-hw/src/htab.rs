//! Hashed page-table initializer.
//!
//! An `htab` node owns a naturally-aligned hash table in simulated RAM
//! (`real-address`, `nr-bytes`); its `pte` children each describe a
//! real-to-virtual range to pre-map. At data initialization the table is
//! zeroed and every child's pages are entered, all through privileged DMA so
//! the table can live in write-protected memory.
//!
//! Hashing follows the classic 32-bit segmented MMU: the segment id is the
//! top four virtual-address bits, the primary hash is `vsid ^ page_index`,
//! and each group holds eight entries of two big-endian words
//! (`valid | vsid<<7 | api` and `rpn | wimg<<3 | pp`).

use arbor_tree::{Device, HwModel, Result, TreeError};
use tracing::debug;

const PAGE_SHIFT: u64 = 12;
const PTE_SIZE: u64 = 8;
const PTEG_SIZE: u64 = 64;
const MIN_HTAB_BYTES: u64 = 0x1_0000;

/// Marker model for `pte` children; the parent `htab` does the work.
pub struct HwPte;

impl HwModel for HwPte {
    fn model_name(&self) -> &'static str {
        "pte"
    }
}

pub struct HwHtab {
    table_base: u64,
    table_bytes: u64,
}

impl HwHtab {
    pub fn new() -> Self {
        Self {
            table_base: 0,
            table_bytes: 0,
        }
    }

    fn hash_mask(&self) -> u64 {
        self.table_bytes / PTEG_SIZE - 1
    }

    /// Installs one page mapping, scanning its primary group for a free
    /// entry.
    fn map_page(&self, dev: &Device<'_>, va: u64, ra: u64, wimg: u64, pp: u64) -> Result<()> {
        let vsid = va >> 28;
        let page_index = va >> PAGE_SHIFT & 0xFFFF;
        let hash = (vsid ^ page_index) & self.hash_mask();
        let pteg = self.table_base + hash * PTEG_SIZE;
        let api = va >> 22 & 0x3F;

        let word0 = (1u32 << 31) | (vsid as u32) << 7 | api as u32;
        let word1 = (ra as u32 & 0xFFFF_F000) | (wimg as u32) << 3 | pp as u32;

        for slot in 0..PTEG_SIZE / PTE_SIZE {
            let entry = pteg + slot * PTE_SIZE;
            let mut current = [0u8; 4];
            if dev.dma_read(0, entry, &mut current) != 4 {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!("page table at {entry:#x} is not backed by memory"),
                });
            }
            if u32::from_be_bytes(current) >> 31 != 0 {
                continue; // occupied
            }
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&word0.to_be_bytes());
            bytes[4..].copy_from_slice(&word1.to_be_bytes());
            if dev.dma_write(0, entry, &bytes, true) != 8 {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!("page table write at {entry:#x} failed"),
                });
            }
            debug!(
                dev = %dev.path(),
                va = format_args!("{va:#x}"),
                ra = format_args!("{ra:#x}"),
                entry = format_args!("{entry:#x}"),
                "mapped page"
            );
            return Ok(());
        }
        Err(TreeError::Config {
            path: dev.path(),
            reason: format!("page table group for va {va:#x} is full"),
        })
    }
}

impl Default for HwHtab {
    fn default() -> Self {
        Self::new()
    }
}

impl HwModel for HwHtab {
    fn model_name(&self) -> &'static str {
        "htab"
    }

    fn init_data(&mut self, dev: Device<'_>) -> Result<()> {
        let base = dev.find_integer("real-address")?;
        let bytes = dev.find_integer("nr-bytes")?;
        if bytes < MIN_HTAB_BYTES || !bytes.is_power_of_two() || base % bytes != 0 {
            return Err(TreeError::Config {
                path: dev.path(),
                reason: format!(
                    "page table {base:#x}+{bytes:#x} must be a naturally aligned power of two of at least {MIN_HTAB_BYTES:#x} bytes"
                ),
            });
        }
        self.table_base = base;
        self.table_bytes = bytes;

        // Zero the table through the loader path.
        let zeros = vec![0u8; 0x1000];
        let mut offset = 0;
        while offset < bytes {
            let chunk = zeros.len().min((bytes - offset) as usize);
            if dev.dma_write(0, base + offset, &zeros[..chunk], true) != chunk {
                return Err(TreeError::Config {
                    path: dev.path(),
                    reason: format!(
                        "page table {base:#x}+{bytes:#x} is not backed by memory"
                    ),
                });
            }
            offset += chunk as u64;
        }

        // Children ran their (empty) data phase already; install their
        // mappings now that the table exists.
        let tree = dev.tree();
        for child in tree.children(dev.id()) {
            let child_dev = tree.device(child);
            let ra = child_dev.find_integer("real-address")?;
            let va = child_dev.find_integer("virtual-address")?;
            let nr_bytes = child_dev.find_integer("nr-bytes")?;
            let wimg = child_dev.find_integer_or("wimg", 0x7)?;
            let pp = child_dev.find_integer_or("pp", 0x2)?;
            if ra % (1 << PAGE_SHIFT) != 0 || va % (1 << PAGE_SHIFT) != 0 {
                return Err(TreeError::Config {
                    path: tree.path(child),
                    reason: format!("mapping {va:#x}->{ra:#x} is not page aligned"),
                });
            }

            let mut offset = 0;
            while offset < nr_bytes {
                self.map_page(&dev, va + offset, ra + offset, wimg, pp)?;
                offset += 1 << PAGE_SHIFT;
            }
        }
        Ok(())
    }
}
