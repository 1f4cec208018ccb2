//! Weak tables and ephemerons.
//!
//! Weak tables reach the atomic phase linked on one of three gray lists:
//! `weak` (weak values), `ephemeron` (weak keys with white-to-white entries)
//! and `allweak`. Ephemerons are converged first, then entries whose key or
//! value is still white are removed.

use crate::heap::Heap;
use crate::object::{Color, Object};

use super::mark::is_cleared;
use super::state::GrayList;

impl Heap {
    /// Re-traverses ephemeron tables until no pass marks anything new.
    ///
    /// Each pass alternates the direction in which hash parts are walked,
    /// which shortens chains of ephemerons linked in insertion order.
    pub(crate) fn converge_ephemerons(&mut self) {
        let mut reverse = false;
        loop {
            let mut cursor = self.gc.ephemeron.take();
            let mut changed = false;
            {
                let mut marker = self.marker();
                let objects = marker.objects;
                while let Some(idx) = cursor {
                    cursor = marker.headers[idx as usize].gclist;
                    marker.headers[idx as usize].color = Color::Black;
                    if let Some(Object::Table(table)) = &objects[idx as usize] {
                        changed |= marker.traverse_ephemeron(idx, table, reverse);
                    }
                }
                if changed {
                    marker.propagate_all();
                }
            }
            if !changed {
                break;
            }
            reverse = !reverse;
        }
    }

    /// Removes entries with a collected key from every table on `list`.
    pub(crate) fn clear_by_keys(&mut self, list: GrayList) {
        let mut cursor = *self.gc.gray_head_mut(list);
        let headers = &mut self.arena.headers;
        let objects = &mut self.arena.objects;
        while let Some(idx) = cursor {
            cursor = headers[idx as usize].gclist;
            if let Some(Object::Table(table)) = &mut objects[idx as usize] {
                table.retain_keys(|k| !is_cleared(headers, k.as_object()));
            }
        }
    }

    /// Removes entries with a collected value from the tables on `list`, up
    /// to but excluding the table at `until`.
    pub(crate) fn clear_by_values(&mut self, list: GrayList, until: Option<u32>) {
        let mut cursor = *self.gc.gray_head_mut(list);
        let headers = &mut self.arena.headers;
        let objects = &mut self.arena.objects;
        while cursor != until {
            let Some(idx) = cursor else {
                break;
            };
            cursor = headers[idx as usize].gclist;
            if let Some(Object::Table(table)) = &mut objects[idx as usize] {
                table.retain_values(|v| !is_cleared(headers, v.as_object()));
            }
        }
    }
}
