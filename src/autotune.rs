use sysinfo::System;

const MAX_DECODE_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct DispatchTune {
    pub decode_workers: usize,
    pub cores: usize,
    pub ram_avail: u64,
}

// Pick how many decode workers may run at once. Each worker holds the whole
// capture plus its samples and raster, so budget roughly 3x the largest input.
pub fn decode_worker_budget(largest_input_bytes: u64, override_workers: Option<usize>) -> DispatchTune {
    let cores = num_cpus::get().max(1);
    let (_total, ram_avail) = system_ram_bytes();
    let decode_workers = match override_workers {
        Some(n) => n.max(1),
        None => budget_for(cores, ram_avail, largest_input_bytes),
    };
    DispatchTune {
        decode_workers,
        cores,
        ram_avail,
    }
}

fn budget_for(cores: usize, ram_avail: u64, largest_input_bytes: u64) -> usize {
    let mut workers = (cores / 2).clamp(1, MAX_DECODE_WORKERS);

    let per_worker = largest_input_bytes.saturating_mul(3).max(1);
    // Unknown RAM (0) leaves the core-based pick alone.
    if ram_avail > 0 {
        let fit = (ram_avail / 2) / per_worker;
        workers = workers.min(fit as usize);
    }
    workers.max(1)
}

fn system_ram_bytes() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn budget_follows_cores_when_ram_is_plentiful() {
        assert_eq!(budget_for(1, 64 * GIB, 1024), 1);
        assert_eq!(budget_for(8, 64 * GIB, 1024), 4);
        assert_eq!(budget_for(64, 64 * GIB, 1024), MAX_DECODE_WORKERS);
    }

    #[test]
    fn budget_shrinks_for_large_inputs() {
        // 1 GiB captures with 8 GiB free: (4 GiB) / (3 GiB) = 1 worker.
        assert_eq!(budget_for(16, 8 * GIB, GIB), 1);
        // Still at least one worker even if nothing fits.
        assert_eq!(budget_for(16, GIB, 4 * GIB), 1);
    }

    #[test]
    fn unknown_ram_keeps_core_budget() {
        assert_eq!(budget_for(8, 0, GIB), 4);
    }

    #[test]
    fn live_budget_is_positive() {
        assert!(decode_worker_budget(1024, None).decode_workers >= 1);
    }

    #[test]
    fn override_wins_but_stays_positive() {
        assert_eq!(decode_worker_budget(GIB, Some(12)).decode_workers, 12);
        assert_eq!(decode_worker_budget(GIB, Some(0)).decode_workers, 1);
    }
}
