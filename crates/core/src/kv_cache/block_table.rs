use crate::error::{CoreError, Result};

/// Resolves one sequence's logical token positions to physical cache slots.
///
/// The serving layer hands each sequence an ordered list of block ids;
/// position `p` lives at slot `blocks[p / block_size] * block_size +
/// p % block_size`. Blocks need not be contiguous or ordered in the slot
/// space.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<u32>,
    block_size: usize,
}

impl BlockTable {
    pub fn new(blocks: Vec<u32>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(CoreError::config("block_size must be non-zero"));
        }
        Ok(Self { blocks, block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of token positions this table can resolve.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// Physical slot of logical position `position`.
    pub fn slot(&self, position: usize) -> Result<usize> {
        match self.blocks.get(position / self.block_size) {
            Some(&block) => Ok(block as usize * self.block_size + position % self.block_size),
            None => Err(CoreError::CacheIndex {
                slot: position,
                capacity: self.capacity(),
            }),
        }
    }

    /// Physical slots of positions `0..num_tokens`, in position order.
    pub fn slots(&self, num_tokens: usize) -> Result<Vec<usize>> {
        (0..num_tokens).map(|p| self.slot(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_positions_through_blocks() {
        let table = BlockTable::new(vec![7, 2], 4).unwrap();

        assert_eq!(table.capacity(), 8);
        assert_eq!(table.slot(0).unwrap(), 28);
        assert_eq!(table.slot(3).unwrap(), 31);
        assert_eq!(table.slot(4).unwrap(), 8);
        assert_eq!(table.slots(6).unwrap(), vec![28, 29, 30, 31, 8, 9]);
    }

    #[test]
    fn rejects_position_beyond_capacity() {
        let table = BlockTable::new(vec![0, 1], 4).unwrap();
        let err = table.slots(9).unwrap_err();
        assert!(matches!(err, CoreError::CacheIndex { slot: 8, .. }));
    }

    #[test]
    fn rejects_zero_block_size() {
        let err = BlockTable::new(vec![0], 0).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }
}
