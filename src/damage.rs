//! Accumulation of the global damage region.
//!
//! The tracker owns a single server-side region holding the union of all
//! damage reported since the last paint, `None` while empty. Only the event
//! dispatcher and plugin pre-paint hooks may add to it; only the paint
//! scheduler may reset it, and only after a successful paint.

use std::sync::Weak;

use x11rb::{
    connection::Connection as _,
    protocol::xfixes::{self, ConnectionExt as _},
    rust_connection::RustConnection,
};

use crate::{error::Error, window::ServerRegion};

/// The global damage region and the forced-repaint flag.
#[derive(Debug)]
pub struct DamageTracker {
    conn: Weak<RustConnection>,
    damaged: Option<ServerRegion>,
    /// When set, the next paint repaints everything regardless of damage.
    pub force_repaint: bool,
}

impl DamageTracker {
    pub fn new(conn: Weak<RustConnection>) -> Self {
        DamageTracker {
            conn,
            damaged: None,
            force_repaint: false,
        }
    }

    /// Whether any damage is pending.
    pub fn is_damaged(&self) -> bool {
        self.damaged.is_some()
    }

    /// The region to clip the next paint to, if any.
    pub fn region_id(&self) -> Option<xfixes::Region> {
        self.damaged.as_ref().map(ServerRegion::id)
    }

    /// Unions `region` into the damaged region. The input is left alive and
    /// still belongs to the caller.
    pub fn add_region(&mut self, region: xfixes::Region) -> Result<(), Error> {
        let Some(conn) = self.conn.upgrade() else {
            return Ok(());
        };

        match &self.damaged {
            Some(damaged) => {
                conn.xfixes_union_region(damaged.id(), region, damaged.id())?;
            }
            None => {
                let damaged = conn.generate_id()?;
                conn.xfixes_create_region(damaged, &[])?;
                conn.xfixes_union_region(damaged, region, damaged)?;
                self.damaged = Some(ServerRegion::new(self.conn.clone(), damaged));
            }
        }
        Ok(())
    }

    /// Unions a temporary region into the damaged region, consuming it. When
    /// no damage is pending yet the input is adopted wholesale, saving the
    /// copy.
    pub fn adopt_region(&mut self, region: ServerRegion) -> Result<(), Error> {
        match &self.damaged {
            Some(_) => {
                self.add_region(region.id())?;
                drop(region);
            }
            None => self.damaged = Some(region),
        }
        Ok(())
    }

    /// Empties the damage region. Idempotent.
    pub fn reset(&mut self) {
        self.damaged.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tracker with a dead connection exercises the client-side
    // bookkeeping; the server-side region algebra is covered by the X
    // server itself.
    fn tracker() -> DamageTracker {
        DamageTracker::new(Weak::new())
    }

    #[test]
    fn starts_clean() {
        let tracker = tracker();
        assert!(!tracker.is_damaged());
        assert!(!tracker.force_repaint);
        assert_eq!(tracker.region_id(), None);
    }

    #[test]
    fn adopt_makes_damaged() {
        let mut tracker = tracker();
        tracker.adopt_region(ServerRegion::new(Weak::new(), 42)).unwrap();
        assert!(tracker.is_damaged());
        assert_eq!(tracker.region_id(), Some(42));
    }

    #[test]
    fn adopt_into_existing_unions_and_consumes() {
        let mut tracker = tracker();
        tracker.adopt_region(ServerRegion::new(Weak::new(), 42)).unwrap();
        tracker.adopt_region(ServerRegion::new(Weak::new(), 43)).unwrap();
        // The first region stays the accumulation target.
        assert_eq!(tracker.region_id(), Some(42));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut tracker = tracker();
        tracker.adopt_region(ServerRegion::new(Weak::new(), 42)).unwrap();
        tracker.reset();
        assert!(!tracker.is_damaged());
        tracker.reset();
        assert!(!tracker.is_damaged());
        assert_eq!(tracker.region_id(), None);
    }
}
