// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::config::EncoderConfig;

/// Coding order of the pictures of a sub-GOP, indexed by the sub-GOP size. Entries are display
/// offsets from the previous anchor, the closing anchor (offset == size) is always coded first
/// and the B pictures follow in hierarchical order.
pub(crate) const SUBGOP_ORDER: [&[usize]; 9] = [
    &[],
    &[1],
    &[2, 1],
    &[3, 1, 2],
    &[4, 2, 1, 3],
    &[5, 3, 1, 2, 4],
    &[6, 3, 1, 2, 5, 4],
    &[7, 4, 2, 1, 3, 6, 5],
    &[8, 4, 2, 1, 3, 6, 5, 7],
];

/// Static reference structure of one coding position of a sub-GOP.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpsTemplate {
    /// Coding order deltas of the references, forward reference first for B pictures
    pub ref_pic: Vec<i64>,
    /// Coding order deltas of the pictures to evict once this picture is scheduled
    pub rm_pic: Vec<i64>,
    pub qp_offset: i32,
    pub temporal_id: u8,
    /// Whether later pictures reference this one
    pub referenced_by_others: bool,
}

/// Maximum number of positions a picture is coded ahead of its display position in sub-GOPs of
/// up to `size` pictures.
pub(crate) fn reorder_depth(size: usize) -> usize {
    SUBGOP_ORDER[1..=size]
        .iter()
        .flat_map(|order| {
            order
                .iter()
                .enumerate()
                .map(|(pos, &offset)| (pos + 1).saturating_sub(offset))
        })
        .max()
        .unwrap_or(0)
}

/// Reference structure of every coding position of every sub-GOP the lookahead can produce.
///
/// Deltas are expressed in coding order, so the template of a sub-GOP depends on the size of the
/// sub-GOP coded before it: that is where its previous anchor sits.
#[derive(Clone, Debug)]
pub struct GopTemplate {
    /// Indexed by previous sub-GOP size, sub-GOP size, then coding position
    tables: Vec<Vec<Vec<RpsTemplate>>>,
}

impl GopTemplate {
    pub fn new(config: &EncoderConfig) -> Self {
        let nominal = config.subgop_size();

        let mut tables = vec![vec![vec![]; nominal + 1]; nominal + 1];
        if config.is_all_intra() {
            tables[1][1] = vec![RpsTemplate::default()];
        } else if nominal == 1 {
            tables[1][1] = vec![Self::low_delay(config.max_ref)];
        } else {
            for prev in 1..=nominal {
                for size in 1..=nominal {
                    tables[prev][size] = Self::random_access(prev, size, nominal);
                }
            }
        }

        if let Some(custom) = &config.gop_template {
            tables[nominal][nominal] = custom.clone();
        }

        Self { tables }
    }

    /// Template of the picture at coding `position` of a sub-GOP of `size` pictures, following
    /// a sub-GOP of `prev_size` pictures.
    pub fn get(&self, prev_size: usize, size: usize, position: usize) -> Option<&RpsTemplate> {
        self.tables.get(prev_size)?.get(size)?.get(position)
    }

    /// Every picture references the previous one and keeps a window of `max_ref` references.
    fn low_delay(max_ref: usize) -> RpsTemplate {
        RpsTemplate {
            ref_pic: vec![1],
            rm_pic: vec![max_ref as i64],
            qp_offset: 0,
            temporal_id: 0,
            referenced_by_others: true,
        }
    }

    /// Derives the hierarchical-B structure of a sub-GOP of `size` pictures from
    /// [`SUBGOP_ORDER`].
    ///
    /// The anchor references the previous anchor, coded `prev` positions earlier. Each B
    /// picture references the closest already coded pictures before and after it in display
    /// order. The anchor evicts the B pictures of the previous sub-GOP and every picture of the
    /// sub-GOP before that one, which leaves the previous anchor as the only reference carried
    /// over. As sub-GOPs never exceed `nominal` pictures, the anchor lists every delta that can
    /// point to one of them; deltas hitting non-reference pictures are dropped by the builder.
    fn random_access(prev: usize, size: usize, nominal: usize) -> Vec<RpsTemplate> {
        let order = SUBGOP_ORDER[size];
        let prev = prev as i64;

        // (display offset, coding position) of the pictures available as references, starting
        // with the previous anchor.
        let mut coded: Vec<(usize, i64)> = vec![(0, -prev)];
        let mut temporal_ids = vec![0u8; size];
        let mut templates = Vec::with_capacity(size);

        for (pos, &offset) in order.iter().enumerate() {
            let pos_i = pos as i64;
            let template = if pos == 0 {
                RpsTemplate {
                    ref_pic: vec![prev],
                    rm_pic: (1..prev).chain(prev + 1..=prev + nominal as i64).collect(),
                    qp_offset: 0,
                    temporal_id: 0,
                    referenced_by_others: true,
                }
            } else {
                let forward = coded
                    .iter()
                    .filter(|(o, _)| *o < offset)
                    .max_by_key(|(o, _)| *o)
                    .copied()
                    .unwrap_or((0, -prev));
                let backward = coded
                    .iter()
                    .filter(|(o, _)| *o > offset)
                    .min_by_key(|(o, _)| *o)
                    .copied()
                    .unwrap_or((size, 0));

                let layer = |p: i64| {
                    if p <= 0 {
                        0
                    } else {
                        temporal_ids[p as usize]
                    }
                };
                let temporal_id = 1 + layer(forward.1).max(layer(backward.1));
                temporal_ids[pos] = temporal_id;

                RpsTemplate {
                    ref_pic: vec![pos_i - forward.1, pos_i - backward.1],
                    rm_pic: vec![],
                    qp_offset: i32::from(temporal_id),
                    temporal_id,
                    referenced_by_others: false,
                }
            };

            templates.push(template);
            coded.push((offset, pos_i));
        }

        // A B picture is a reference if a later position of the sub-GOP uses it.
        for pos in 1..size {
            let referenced = (pos + 1..size).any(|later| {
                templates[later]
                    .ref_pic
                    .iter()
                    .any(|&delta| later as i64 - delta == pos as i64)
            });
            templates[pos].referenced_by_others = referenced;
        }

        templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_tables_are_permutations() {
        for (size, order) in SUBGOP_ORDER.iter().enumerate().skip(1) {
            let mut sorted = order.to_vec();
            sorted.sort();
            assert_eq!(sorted, (1..=size).collect::<Vec<_>>());
            assert_eq!(order[0], size);
        }
    }

    #[test]
    fn depth() {
        assert_eq!(reorder_depth(1), 0);
        assert_eq!(reorder_depth(2), 1);
        assert_eq!(reorder_depth(4), 2);
        assert_eq!(reorder_depth(8), 3);
    }

    #[test]
    fn hierarchical_four() {
        let config = EncoderConfig {
            num_bframes: 3,
            ..Default::default()
        };
        let gop = GopTemplate::new(&config);

        // Steady state, coding order P8 B6 B5 B7 after P4 B2 B1 B3
        let anchor = gop.get(4, 4, 0).unwrap();
        assert_eq!(anchor.ref_pic, vec![4]);
        assert_eq!(anchor.rm_pic, vec![1, 2, 3, 5, 6, 7, 8]);
        assert!(anchor.referenced_by_others);

        // B6: P4 and P8
        let b6 = gop.get(4, 4, 1).unwrap();
        assert_eq!(b6.ref_pic, vec![5, 1]);
        assert_eq!(b6.temporal_id, 1);
        assert!(b6.referenced_by_others);

        // B5: P4 and B6
        let b5 = gop.get(4, 4, 2).unwrap();
        assert_eq!(b5.ref_pic, vec![6, 1]);
        assert_eq!(b5.temporal_id, 2);
        assert_eq!(b5.qp_offset, 2);
        assert!(!b5.referenced_by_others);

        // B7: B6 and P8
        let b7 = gop.get(4, 4, 3).unwrap();
        assert_eq!(b7.ref_pic, vec![2, 3]);
        assert_eq!(b7.temporal_id, 2);
        assert!(!b7.referenced_by_others);
    }

    #[test]
    fn first_subgop_after_intra() {
        let config = EncoderConfig {
            num_bframes: 3,
            ..Default::default()
        };
        let gop = GopTemplate::new(&config);

        // I0 P4 B2 B1 B3: the previous anchor is right before the sub-GOP.
        assert_eq!(gop.get(1, 4, 0).unwrap().ref_pic, vec![1]);
        assert_eq!(gop.get(1, 4, 1).unwrap().ref_pic, vec![2, 1]);
        assert_eq!(gop.get(1, 4, 2).unwrap().ref_pic, vec![3, 1]);
        assert_eq!(gop.get(1, 4, 3).unwrap().ref_pic, vec![2, 3]);

        // Shorter sub-GOPs are available for flushes.
        assert_eq!(gop.get(4, 2, 1).unwrap().ref_pic, vec![5, 1]);
        assert!(gop.get(4, 5, 0).is_none());
    }

    #[test]
    fn low_delay_and_intra() {
        let config = EncoderConfig {
            num_bframes: 0,
            max_ref: 3,
            ..Default::default()
        };
        let gop = GopTemplate::new(&config);
        let template = gop.get(1, 1, 0).unwrap();
        assert_eq!(template.ref_pic, vec![1]);
        assert_eq!(template.rm_pic, vec![3]);

        let config = EncoderConfig {
            intra_period_max: 1,
            ..Default::default()
        };
        let gop = GopTemplate::new(&config);
        assert_eq!(gop.get(1, 1, 0), Some(&RpsTemplate::default()));
    }

    #[test]
    fn custom_template_replaces_nominal() {
        let custom = RpsTemplate {
            ref_pic: vec![7],
            ..Default::default()
        };
        let config = EncoderConfig {
            num_bframes: 0,
            gop_template: Some(vec![custom.clone()]),
            ..Default::default()
        };
        let gop = GopTemplate::new(&config);
        assert_eq!(gop.get(1, 1, 0), Some(&custom));
    }
}
