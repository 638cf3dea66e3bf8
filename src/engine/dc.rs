//! Diverge/converge: compressing far-from-spread rungs into landmark
//! orders and unwinding them as the spread approaches.
//!
//! The scan classifies every settled ping-pong position against the
//! highest-buy boundary, cancels the members of at most one convergence
//! group per market per tick (reason ForDC), and records the group. When
//! the last cancel of a group confirms, the handoff re-places the orders:
//! one landmark for a convergence, one normal order per rung for a
//! divergence. Indices stay marked in `diverging_converging` for the whole
//! transit so the auto-set pass cannot double-own them.

use std::collections::HashMap;

use tracing::info;

use crate::exchange::ExchangeAdapter;
use crate::types::Side;

use super::{Engine, PosId};

/// A diverge/converge handoff waiting for its cancels to confirm.
#[derive(Debug)]
pub(crate) struct DcGroup {
    pub(crate) market: String,
    /// Members still awaiting cancel confirmation.
    pub(crate) positions: Vec<PosId>,
    /// True: replace with one landmark. False: replace with one normal
    /// order per recorded index.
    pub(crate) landmark: bool,
    pub(crate) indices: Vec<u32>,
    pub(crate) side: Side,
}

impl<A: ExchangeAdapter> Engine<A> {
    /// Is this rung index currently mid-transit in a DC handoff?
    pub fn is_index_diverging_converging(&self, market: &str, idx: u32) -> bool {
        self.diverging_converging
            .get(market)
            .is_some_and(|v| v.contains(&idx))
    }

    fn mark_index(&mut self, market: &str, idx: u32) {
        self.diverging_converging
            .entry(market.to_string())
            .or_default()
            .push(idx);
    }

    fn unmark_index(&mut self, market: &str, idx: u32) {
        if let Some(v) = self.diverging_converging.get_mut(market) {
            if let Some(at) = v.iter().position(|i| *i == idx) {
                v.swap_remove(at);
            }
        }
    }

    /// Slow-tick entry: maintenance epoch, grace pruning, then the DC scan.
    pub fn on_check_diverge_converge(&mut self) {
        self.check_maintenance();
        self.clean_grace_times();

        if self.adapter.yield_to_flow_control()
            || self.adapter.queued_commands() >= self.adapter.dc_queue_limit()
        {
            return;
        }

        // highest buy rung index per market, over settled ping-pong orders
        let mut hi_buy_idx: HashMap<String, i64> = HashMap::new();
        for (_, pos) in self.arena.iter() {
            if pos.is_onetime || pos.side != Side::Buy {
                continue;
            }
            let entry = hi_buy_idx.entry(pos.market.clone()).or_insert(-1);
            *entry = (*entry).max(pos.highest_index() as i64);
        }

        let mut converge_buys: HashMap<String, Vec<u32>> = HashMap::new();
        let mut converge_sells: HashMap<String, Vec<u32>> = HashMap::new();
        let mut diverge_buys: HashMap<String, Vec<u32>> = HashMap::new();
        let mut diverge_sells: HashMap<String, Vec<u32>> = HashMap::new();

        for (_, pos) in self.arena.iter() {
            if pos.is_onetime {
                continue;
            }
            let Some(info) = self.markets.get(&pos.market) else {
                continue;
            };
            if info.settings.order_dc < 2 {
                continue;
            }
            if pos.is_cancelling || pos.order_id.is_none() {
                continue;
            }
            if pos.is_slippage && !self.settings.should_dc_slippage_orders {
                continue;
            }

            let first_idx = pos.lowest_index();
            if self.is_index_diverging_converging(&pos.market, first_idx) {
                continue;
            }

            let market_hi = hi_buy_idx.get(&pos.market).copied().unwrap_or(-1);
            let nice = info.settings.order_dc_nice as i64;

            if pos.side == Side::Buy {
                let boundary = market_hi - info.settings.landmark_start as i64;
                let already = converge_buys
                    .get(&pos.market)
                    .is_some_and(|v| v.contains(&first_idx))
                    || diverge_buys
                        .get(&pos.market)
                        .is_some_and(|v| v.contains(&first_idx));
                if already {
                    continue;
                }

                let hi_idx = pos.highest_index() as i64;
                if !pos.is_landmark && hi_idx < boundary - nice {
                    converge_buys.entry(pos.market.clone()).or_default().push(first_idx);
                } else if pos.is_landmark && hi_idx > boundary {
                    diverge_buys.entry(pos.market.clone()).or_default().push(first_idx);
                }
            } else {
                let boundary = market_hi + 1 + info.settings.landmark_start as i64;
                let already = converge_sells
                    .get(&pos.market)
                    .is_some_and(|v| v.contains(&first_idx))
                    || diverge_sells
                        .get(&pos.market)
                        .is_some_and(|v| v.contains(&first_idx));
                if already {
                    continue;
                }

                let lo_idx = pos.lowest_index() as i64;
                if !pos.is_landmark && lo_idx > boundary + nice {
                    converge_sells.entry(pos.market.clone()).or_default().push(first_idx);
                } else if pos.is_landmark && lo_idx < boundary {
                    diverge_sells.entry(pos.market.clone()).or_default().push(first_idx);
                }
            }
        }

        self.converge(converge_buys, Side::Buy);
        self.converge(converge_sells, Side::Sell);
        self.diverge(diverge_buys, Side::Buy);
        self.diverge(diverge_sells, Side::Sell);
    }

    /// Combine contiguous candidate rungs into one landmark per market.
    fn converge(&mut self, market_map: HashMap<String, Vec<u32>>, side: Side) {
        let step: i64 = if side == Side::Buy { 1 } else { -1 };

        for (market, mut indices) in market_map {
            let dc = self
                .markets
                .get(&market)
                .map(|m| m.settings.order_dc)
                .unwrap_or(0);
            if dc < 2 || indices.len() < dc as usize {
                continue;
            }

            // walk candidates from the far end of the book inward
            if side == Side::Buy {
                indices.sort_unstable();
            } else {
                indices.sort_unstable_by(|a, b| b.cmp(a));
            }

            let run = indices
                .windows(dc as usize)
                .find(|w| {
                    w.windows(2)
                        .all(|pair| pair[1] as i64 == pair[0] as i64 + step)
                })
                .map(|w| w.to_vec());

            if let Some(run) = run {
                let members: Vec<PosId> = run
                    .iter()
                    .filter_map(|idx| self.position_by_index(&market, *idx))
                    .collect();
                if members.len() != run.len() {
                    continue;
                }

                info!(%market, indices = ?run, "converging");

                for (idx, id) in run.iter().zip(&members) {
                    self.cancel_order(*id, true, crate::types::CancelReason::ForDC);
                    self.mark_index(&market, *idx);
                }

                self.dc_groups.push(DcGroup {
                    market: market.clone(),
                    positions: members,
                    landmark: true,
                    indices: run,
                    side,
                });
                // one convergence per market per tick
            }

            if self.adapter.yield_to_flow_control()
                || self.adapter.queued_commands() >= self.adapter.dc_queue_limit()
            {
                return;
            }
        }
    }

    /// Unwind the lowest-indexed candidate landmark per market.
    fn diverge(&mut self, market_map: HashMap<String, Vec<u32>>, side: Side) {
        for (market, mut indices) in market_map {
            if indices.is_empty() {
                continue;
            }
            indices.sort_unstable();

            let Some(id) = self.position_by_index(&market, indices[0]) else {
                continue;
            };
            let Some(pos) = self.arena.get(id) else {
                continue;
            };
            let covered: Vec<u32> = pos.market_indices.to_vec();

            info!(%market, indices = ?covered, "diverging");

            self.cancel_order(id, true, crate::types::CancelReason::ForDC);
            for idx in &covered {
                self.mark_index(&market, *idx);
            }

            self.dc_groups.push(DcGroup {
                market: market.clone(),
                positions: vec![id],
                landmark: false,
                indices: covered,
                side,
            });

            if self.adapter.yield_to_flow_control()
                || self.adapter.queued_commands() >= self.adapter.dc_queue_limit()
            {
                return;
            }
        }
    }

    /// A ForDC cancel confirmed. When it was the group's last member, hand
    /// the recorded indices back to the book in their new shape.
    pub(crate) fn process_dc_cancel(&mut self, id: PosId) {
        let Some(at) = self.dc_groups.iter().position(|g| g.positions.contains(&id)) else {
            return;
        };
        let mut group = self.dc_groups.swap_remove(at);
        group.positions.retain(|p| *p != id);

        if !group.positions.is_empty() {
            // keep waiting for the remaining cancels
            self.dc_groups.push(group);
            return;
        }

        if group.landmark {
            for idx in &group.indices {
                self.unmark_index(&group.market, *idx);
            }
            self.add_landmark_position_for(&group.market, group.side, &group.indices);
        } else {
            for idx in &group.indices {
                self.unmark_index(&group.market, *idx);

                // rung data may be gone if the market index was cleared
                // mid-handoff
                let rung_exists = self
                    .markets
                    .get(&group.market)
                    .map(|m| m.index.get(*idx).is_some())
                    .unwrap_or(false);
                if !rung_exists {
                    continue;
                }
                self.add_active_from_rung(&group.market, group.side, &[*idx], false);
            }
        }
    }

    /// Detach a position from DC bookkeeping on release. If it was still a
    /// member of a pending group, the whole group is abandoned and all its
    /// indices unmarked - the remaining members' cancels settle as plain
    /// cancels.
    pub(crate) fn remove_from_dc(&mut self, id: PosId) {
        if let Some(at) = self.dc_groups.iter().position(|g| g.positions.contains(&id)) {
            let group = self.dc_groups.swap_remove(at);
            for idx in group.indices {
                self.unmark_index(&group.market, idx);
            }
        }

        let (market, indices) = match self.arena.get(id) {
            Some(pos) => (pos.market.clone(), pos.market_indices.to_vec()),
            None => return,
        };
        for idx in indices {
            // an index can still belong to another pending group (this
            // position was detached from it when its cancel confirmed);
            // those stay marked until that group completes
            let still_pending = self
                .dc_groups
                .iter()
                .any(|g| g.market == market && g.indices.contains(&idx));
            if !still_pending {
                self.unmark_index(&market, idx);
            }
        }
    }
}
