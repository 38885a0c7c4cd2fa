//! Dual-partition data-placement policy (spec.md §4.7).
//!
//! Whether a dentry's writes should also land in the index partition is
//! governed by `write_ip`. The flag starts `false` and can only ever be
//! set back to `true` when a file is truncated to zero length and its
//! name matches the front-end's placement criteria; once a file has
//! grown past that point the flag can only be cleared, never re-set, for
//! the rest of its life, avoiding a file bouncing between partitions as
//! it grows and shrinks.

/// Inputs to the IP-eligibility predicate, gathered from the front-end
/// and the dentry's own state.
#[derive(Debug, Clone, Copy)]
pub struct PlacementContext {
    pub logical_size: u64,
    pub max_ip_file_size: u64,
    pub name_matches_criteria: bool,
    pub deleted: bool,
    pub ip_writable: bool,
}

/// `true` if a dentry in this context is eligible to have `write_ip` set.
///
/// All of the following must hold: IP placement is enabled at all
/// (`max_ip_file_size > 0`), the file's logical size does not exceed it,
/// its name matches the configured criteria, it has not been deleted, and
/// the index partition itself is currently writable.
pub fn is_eligible(ctx: &PlacementContext) -> bool {
    ctx.max_ip_file_size > 0
        && ctx.logical_size <= ctx.max_ip_file_size
        && ctx.name_matches_criteria
        && !ctx.deleted
        && ctx.ip_writable
}

/// Attempt to set `write_ip`. Only legal when `at_zero_truncate` is
/// `true` (the file was just truncated to zero length) and the dentry is
/// currently eligible; returns the new flag value. A request to set the
/// flag outside a zero-truncate is silently ignored (the flag is left
/// unchanged) since spec.md only allows the transition at that specific
/// point.
pub fn try_set_write_ip(current: bool, at_zero_truncate: bool, ctx: &PlacementContext) -> bool {
    if current {
        return true;
    }
    if at_zero_truncate && is_eligible(ctx) {
        return true;
    }
    current
}

/// Clear `write_ip` if the dentry is no longer eligible. Clearing is
/// always legal, at any point in a file's life.
pub fn maybe_clear_write_ip(current: bool, ctx: &PlacementContext) -> bool {
    if current && !is_eligible(ctx) {
        false
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PlacementContext {
        PlacementContext {
            logical_size: 0,
            max_ip_file_size: 1024,
            name_matches_criteria: true,
            deleted: false,
            ip_writable: true,
        }
    }

    #[test]
    fn eligible_when_all_conditions_hold() {
        assert!(is_eligible(&ctx()));
    }

    #[test]
    fn ineligible_when_ip_placement_disabled() {
        let mut c = ctx();
        c.max_ip_file_size = 0;
        assert!(!is_eligible(&c));
    }

    #[test]
    fn ineligible_once_past_max_size() {
        let mut c = ctx();
        c.logical_size = 2048;
        assert!(!is_eligible(&c));
    }

    #[test]
    fn set_only_takes_effect_at_zero_truncate() {
        let c = ctx();
        assert!(!try_set_write_ip(false, false, &c));
        assert!(try_set_write_ip(false, true, &c));
    }

    #[test]
    fn clear_works_mid_file_once_ineligible() {
        let mut c = ctx();
        c.logical_size = 2048;
        assert!(!maybe_clear_write_ip(true, &c));
    }

    #[test]
    fn already_set_flag_is_not_reevaluated_by_try_set() {
        let mut c = ctx();
        c.logical_size = 2048; // now ineligible
        assert!(try_set_write_ip(true, false, &c));
    }
}
