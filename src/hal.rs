use alloc::vec::Vec;

use crate::AhciError;

pub trait Hal {
    /// Convert a virtual address to a physical address.
    fn virt_to_phys(va: usize) -> usize;

    /// Current time in milliseconds
    fn current_ms() -> u64;

    /// Flush the Dcache.
    fn flush_dcache();
}

/// Granule at which virtual to physical translation is assumed to change.
pub const PAGE_SIZE: usize = 4096;

/// One physically contiguous run of a data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: u64,
    pub len: u32,
}

/// Builds the scatter/gather list for `len` bytes at `va`.
///
/// Pages that turn out to be physically adjacent are merged, runs are split
/// at `max_seg` bytes. Fails when the list would need more than
/// `max_entries` entries; `out` is left empty in that case.
pub(crate) fn map_sg<H: Hal>(
    va: usize,
    len: usize,
    max_seg: usize,
    max_entries: usize,
    out: &mut Vec<SgEntry>,
) -> Result<(), AhciError> {
    out.clear();
    let mut offset = 0;
    while offset < len {
        let addr = va + offset;
        let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(len - offset);
        let phys = H::virt_to_phys(addr) as u64;

        match out.last_mut() {
            Some(last)
                if last.phys + last.len as u64 == phys && last.len as usize + chunk <= max_seg =>
            {
                last.len += chunk as u32;
            }
            _ => {
                if out.len() == max_entries {
                    out.clear();
                    return Err(AhciError::TooManySegments(max_entries));
                }
                out.push(SgEntry {
                    phys,
                    len: chunk as u32,
                });
            }
        }
        offset += chunk;
    }
    Ok(())
}

pub(crate) fn wait_until_timeout<H: Hal>(cond: impl Fn() -> bool, timeout: u64) -> bool {
    let start = H::current_ms();
    loop {
        if cond() {
            return true;
        }
        if H::current_ms().saturating_sub(start) > timeout {
            return false;
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scattered;

    impl Hal for Scattered {
        // Every other page is remapped far away.
        fn virt_to_phys(va: usize) -> usize {
            let page = va / PAGE_SIZE;
            if page % 2 == 0 { va } else { va + 0x1000_0000 }
        }

        fn current_ms() -> u64 {
            0
        }

        fn flush_dcache() {}
    }

    struct Identity;

    impl Hal for Identity {
        fn virt_to_phys(va: usize) -> usize {
            va
        }

        fn current_ms() -> u64 {
            0
        }

        fn flush_dcache() {}
    }

    #[test]
    fn contiguous_pages_merge() {
        let mut sg = Vec::new();
        map_sg::<Identity>(0x10_0800, 3 * PAGE_SIZE, 1 << 22, 8, &mut sg).unwrap();
        assert_eq!(
            sg,
            [SgEntry {
                phys: 0x10_0800,
                len: 3 * PAGE_SIZE as u32
            }]
        );
    }

    #[test]
    fn discontiguous_pages_split() {
        let mut sg = Vec::new();
        map_sg::<Scattered>(0x20_0000, 2 * PAGE_SIZE + 16, 1 << 22, 8, &mut sg).unwrap();
        assert_eq!(sg.len(), 3);
        assert_eq!(sg[0].len as usize, PAGE_SIZE);
        assert_eq!(sg[1].phys, 0x1020_1000);
        assert_eq!(sg[2].len, 16);
    }

    #[test]
    fn segment_limit_and_entry_limit() {
        let mut sg = Vec::new();
        map_sg::<Identity>(0, 4 * PAGE_SIZE, 2 * PAGE_SIZE, 8, &mut sg).unwrap();
        assert_eq!(sg.len(), 2);

        let err = map_sg::<Identity>(0, 4 * PAGE_SIZE, PAGE_SIZE, 3, &mut sg).unwrap_err();
        assert_eq!(err, AhciError::TooManySegments(3));
        assert!(sg.is_empty());
    }
}
