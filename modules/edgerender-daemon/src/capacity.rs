//! Render-service capacity reservation.
//!
//! A fraction of the fleet's free capacity stays reserved for interactive
//! render traffic; only the remainder is available to recache dispatch.

use edgerender_common::RsInfo;

/// Total free render slots across healthy RS instances.
pub fn total_free(instances: &[RsInfo]) -> u32 {
    instances.iter().map(|rs| rs.free()).sum()
}

/// Free slots available to recache dispatch after reservation.
/// `reserved = floor(total_free * reserved_frac)`.
pub fn available_for_recache(total_free: u32, reserved_frac: f64) -> u32 {
    let reserved = (total_free as f64 * reserved_frac.clamp(0.0, 1.0)).floor() as u32;
    total_free.saturating_sub(reserved)
}

/// Snapshot of the capacity block for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CapacitySnapshot {
    pub total_free: u32,
    pub reserved: u32,
    pub available: u32,
    pub reservation: f64,
}

pub fn snapshot(instances: &[RsInfo], reserved_frac: f64) -> CapacitySnapshot {
    let total = total_free(instances);
    let available = available_for_recache(total, reserved_frac);
    CapacitySnapshot {
        total_free: total,
        reserved: total - available,
        available,
        reservation: reserved_frac,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(capacity: u32, load: u32) -> RsInfo {
        RsInfo {
            rs_id: "rs-1".into(),
            address: "http://rs-1:9000".into(),
            capacity,
            load,
        }
    }

    #[test]
    fn free_capacity_sums_across_instances() {
        let fleet = vec![rs(10, 4), rs(8, 8), rs(4, 1)];
        assert_eq!(total_free(&fleet), 6 + 0 + 3);
    }

    #[test]
    fn overloaded_instance_contributes_zero() {
        let fleet = vec![rs(4, 9)];
        assert_eq!(total_free(&fleet), 0);
    }

    #[test]
    fn thirty_percent_reservation() {
        assert_eq!(available_for_recache(10, 0.3), 7);
        assert_eq!(available_for_recache(9, 0.3), 7); // floor(2.7) = 2 reserved
        assert_eq!(available_for_recache(0, 0.3), 0);
        assert_eq!(available_for_recache(1, 0.3), 1); // floor(0.3) = 0 reserved
    }

    #[test]
    fn full_reservation_leaves_nothing() {
        assert_eq!(available_for_recache(10, 1.0), 0);
        assert_eq!(available_for_recache(10, 0.0), 10);
    }

    #[test]
    fn snapshot_is_consistent() {
        let fleet = vec![rs(10, 0)];
        let snap = snapshot(&fleet, 0.3);
        assert_eq!(snap.total_free, 10);
        assert_eq!(snap.reserved + snap.available, snap.total_free);
    }
}
