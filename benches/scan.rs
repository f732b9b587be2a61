//! ## Usage
//!
//! To run the benchmarks, execute the following command in the console:
//!
//! ```sh
//! cargo bench --bench scan
//! ```

use divan::Bencher;
use gausplat_scan::{
    backend::{BufferUsages, Device, HostDevice, WgpuDevice},
    scan::{PrefixScan, PrefixScanConfig},
    stage::StageGroup,
};

fn main() {
    divan::main();
}

mod cpu {
    use super::*;

    #[divan::bench(sample_count = 100, sample_size = 1)]
    fn scan_add(bencher: Bencher) {
        bencher
            .with_inputs(data::random_vec_u32())
            .bench_local_refs(|v| {
                v.iter()
                    .scan(0_u32, |state, &x| {
                        *state = state.wrapping_add(x);
                        Some(*state)
                    })
                    .collect::<Vec<_>>()
            });
    }
}

mod host {
    use super::*;

    #[divan::bench(sample_count = 100, sample_size = 1)]
    fn scan_add(bencher: Bencher) {
        let device = HostDevice::default();
        scan_add_on(bencher, &device);
    }
}

mod gpu {
    use super::*;

    #[divan::bench(sample_count = 100, sample_size = 1)]
    fn scan_add(bencher: Bencher) {
        // No adapter, no benchmark
        let Ok(device) = WgpuDevice::new() else {
            return;
        };
        scan_add_on(bencher, &device);
    }
}

fn scan_add_on<D: Device>(
    bencher: Bencher,
    device: &D,
) {
    let source = device
        .create_buffer_init(
            "source",
            bytemuck::cast_slice(&data::random_vec_u32()()),
            BufferUsages::STORAGE,
        )
        .expect("The source is within the device limits");
    let mut scan =
        PrefixScan::from(PrefixScanConfig::new(device.to_owned(), source));
    // Allocating before sampling
    let output = scan.prefix_scan().expect("The scan is valid");

    bencher.bench_local(|| {
        StageGroup::new(device.to_owned(), "bench")
            .with_stage(&mut scan)
            .dispatch()
            .expect("The scan is valid");
        device.read_buffer(&output)
    });
}

mod data {
    use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

    const SIZE: usize = 1 << 22;
    const ELEMENT_MIN: u32 = 0;
    const ELEMENT_MAX: u32 = (1 << 8) - 1;

    pub fn random_vec_u32() -> impl FnMut() -> Vec<u32> {
        || {
            StdRng::seed_from_u64(0)
                .sample_iter(Uniform::new_inclusive(ELEMENT_MIN, ELEMENT_MAX))
                .take(SIZE)
                .collect()
        }
    }
}
