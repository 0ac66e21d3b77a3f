//! Laying out a fresh volume.

use pfs_alloc::{BlockChainLayout, initialize};
use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_inode::{Inode, write_inode};
use pfs_ondisk::BootRecord;
use pfs_types::{
    BLOCK_SIZE, BlockNumber, InodeNumber, MIN_INODE_LIMIT, MIN_VOLUME_SECTORS, S_IFDIR,
    SECTOR_SIZE, SECTORS_PER_BLOCK, SectorNumber,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Geometry of a volume to be formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Sectors before the metadata record, boot record included.
    pub reserved_sectors: u16,
    pub sector_count: u64,
    /// Upper bound on inode records, including the root directory's.
    pub inode_limit: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            reserved_sectors: 1,
            sector_count: MIN_VOLUME_SECTORS,
            inode_limit: MIN_INODE_LIMIT,
        }
    }
}

impl FormatOptions {
    pub fn validate(&self) -> Result<()> {
        if self.reserved_sectors == 0 {
            return Err(PfsError::InvalidGeometry(
                "reserved sectors must include the boot record".to_owned(),
            ));
        }
        if self.sector_count < MIN_VOLUME_SECTORS {
            return Err(PfsError::InvalidGeometry(format!(
                "volume of {} sectors is below the minimum of {MIN_VOLUME_SECTORS}",
                self.sector_count
            )));
        }
        if self.inode_limit < MIN_INODE_LIMIT {
            return Err(PfsError::InvalidGeometry(format!(
                "inode limit {} is below the minimum of {MIN_INODE_LIMIT}",
                self.inode_limit
            )));
        }
        Ok(())
    }

    /// Device size in bytes needed to hold the volume.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.sector_count * SECTOR_SIZE as u64
    }
}

/// Where `format` put things.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatReport {
    pub superblock_sector: SectorNumber,
    pub root_inode: InodeNumber,
    pub root_block: SectorNumber,
    pub block_chain: BlockChainLayout,
}

/// Write an empty volume onto `dev`, whose block 0 starts the volume.
pub fn format(dev: &dyn BlockDevice, options: &FormatOptions) -> Result<FormatReport> {
    options.validate()?;
    let available = dev.block_count() * SECTORS_PER_BLOCK;
    if available < options.sector_count {
        return Err(PfsError::InvalidGeometry(format!(
            "device holds {available} sectors, volume needs {}",
            options.sector_count
        )));
    }

    let boot = BootRecord {
        reserved_sectors: options.reserved_sectors,
    };
    let mut head = dev.read_block(BlockNumber(0))?.into_inner();
    boot.write_into(&mut head[..SECTOR_SIZE])
        .map_err(|err| pfs_ondisk::parse_error_at(BlockNumber(0), &err))?;
    dev.write_block(BlockNumber(0), &head)?;

    let superblock_sector = boot.superblock_sector();
    let (_, layout) = initialize(
        dev,
        superblock_sector,
        options.sector_count,
        options.inode_limit,
    )?;
    debug!(
        root = layout.root_inode.0,
        chain_head = layout.block_chain.head.0,
        "pools laid out"
    );

    let root = layout.root_inode;
    pfs_dir::write_first_block(dev, layout.root_block, root, root)?;
    let mut inode = Inode::new(root, S_IFDIR | 0o777, 0, 0);
    inode.set_nlink(2);
    inode.set_addr(0, layout.root_block.0)?;
    inode.add_block();
    inode.set_size(BLOCK_SIZE as u64);
    write_inode(dev, &mut inode)?;
    dev.sync()?;

    info!(
        sectors = options.sector_count,
        inode_limit = options.inode_limit,
        root = root.0,
        free_blocks = layout.block_chain.listed_blocks,
        "formatted volume"
    );
    Ok(FormatReport {
        superblock_sector,
        root_inode: root,
        root_block: layout.root_block,
        block_chain: layout.block_chain,
    })
}
