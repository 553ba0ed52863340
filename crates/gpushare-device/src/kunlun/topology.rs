//! Interconnect-aware selection on an 8-device Kunlun board.
//!
//! The board is two wings of four devices, 0-3 and 4-7. Inside a wing,
//! positions 0/2 and 1/3 are directly linked; across wings, device `i` is
//! linked to `i + 4`.

/// Devices on a board
pub const BOARD_SIZE: usize = 8;
/// Devices per wing
pub const WING_SIZE: usize = 4;

const WINGS: [usize; 2] = [0, WING_SIZE];

/// Linked pairs inside a wing, as offsets from the wing start, in fill order
const WING_PAIRS: [[usize; 2]; 2] = [[0, 2], [1, 3]];

/// Linked pairs across wings, in fill order
const CROSS_PAIRS: [[usize; 2]; 4] = [[0, 4], [1, 5], [2, 6], [3, 7]];

/// Four-device groups spanning both wings, in fill order
const CROSS_GROUPS: [[usize; 4]; 2] = [[0, 2, 4, 6], [1, 3, 5, 7]];

fn free_in_wing(free: &[bool; BOARD_SIZE], wing: usize) -> usize {
    free[wing..wing + WING_SIZE].iter().filter(|f| **f).count()
}

fn all_free(free: &[bool; BOARD_SIZE], indices: &[usize]) -> bool {
    indices.iter().all(|i| free[*i])
}

/// Wings ordered so the one with fewer free devices comes first, left on ties
fn wings_by_occupancy(free: &[bool; BOARD_SIZE]) -> [usize; 2] {
    let mut wings = WINGS;
    wings.sort_by_key(|w| free_in_wing(free, *w));
    wings
}

/// Pick `count` linked devices out of the free ones
///
/// Returns device indices in ascending order, or an empty vector when no
/// linked group of that size is free. Only 1, 2, 4 and 8 are valid sizes.
pub fn select(free: &[bool; BOARD_SIZE], count: usize) -> Vec<usize> {
    match count {
        1 => wings_by_occupancy(free)
            .into_iter()
            .filter(|w| free_in_wing(free, *w) > 0)
            .find_map(|w| (w..w + WING_SIZE).find(|i| free[*i]))
            .map(|i| vec![i])
            .unwrap_or_default(),
        2 => {
            for wing in wings_by_occupancy(free) {
                for pair in WING_PAIRS {
                    let pair = [wing + pair[0], wing + pair[1]];
                    if all_free(free, &pair) {
                        return pair.to_vec();
                    }
                }
            }
            CROSS_PAIRS
                .into_iter()
                .find(|pair| all_free(free, pair))
                .map(|pair| pair.to_vec())
                .unwrap_or_default()
        }
        4 => {
            for wing in WINGS {
                let group: Vec<usize> = (wing..wing + WING_SIZE).collect();
                if all_free(free, &group) {
                    return group;
                }
            }
            CROSS_GROUPS
                .into_iter()
                .find(|group| all_free(free, group))
                .map(|group| group.to_vec())
                .unwrap_or_default()
        }
        BOARD_SIZE if free.iter().all(|f| *f) => (0..BOARD_SIZE).collect(),
        _ => Vec::new(),
    }
}
