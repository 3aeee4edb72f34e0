//! Step throughput over a randomly seeded cloud of units.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nck_engine::{EngineConfig, Simulation, UnitTypeSection};
use nck_types::{Domain, Parameters, PickId, Point, Rotation, UnitTypeId, Vector};

fn bench_config() -> EngineConfig {
    EngineConfig {
        parameters: Parameters {
            linear_damp: 0.1,
            angular_damp: 0.1,
            attenuation: 0.5,
            time_factor: 1.0,
        },
        vertex_force_radius: 0.5,
        vertex_force_strength: 50.0,
        central_force_overshoot: 0.25,
        central_force_strength: 50.0,
        domain: Domain::new(Point::new(-20.0, -20.0, -20.0), Point::new(20.0, 20.0, 20.0)),
        unit_types: vec![UnitTypeSection {
            name: "tetra".into(),
            radius: 1.0,
            mass: 1.0,
            moment_of_inertia: [[0.4, 0.0, 0.0], [0.0, 0.4, 0.0], [0.0, 0.0, 0.4]],
            bond_sites: vec![
                [1.0, 0.0, 0.0],
                [-0.333, 0.943, 0.0],
                [-0.333, -0.471, 0.816],
                [-0.333, -0.471, -0.816],
            ],
            mesh_vertices: Vec::new(),
            mesh_triangles: Vec::new(),
        }],
    }
}

fn seeded_simulation(num_units: usize) -> Simulation {
    let config = bench_config();
    let (mut sim, handle) = Simulation::new(&config);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for i in 0..num_units {
        let position = Point::new(
            rng.gen_range(-19.0..19.0),
            rng.gen_range(-19.0..19.0),
            rng.gen_range(-19.0..19.0),
        );
        let axis = Vector::new(
            rng.gen_range(-1.0..1.0f32),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        handle
            .create(
                PickId(i as u16 + 1),
                UnitTypeId(0),
                position,
                Rotation::from_scaled_axis(axis),
                Vector::zeros(),
                Vector::zeros(),
            )
            .expect("queue overflow while seeding");
        handle
            .release(PickId(i as u16 + 1))
            .expect("queue overflow while seeding");
        // Drain periodically so the bounded queue never fills.
        if i % 256 == 255 {
            sim.advance(0.001);
        }
    }
    // Let the cloud settle and bonds form.
    for _ in 0..10 {
        sim.advance(0.01);
    }
    sim
}

fn step_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("advance");
    for num_units in [128usize, 512, 2048] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_units),
            &num_units,
            |b, &n| {
                let mut sim = seeded_simulation(n);
                b.iter(|| sim.advance(0.016));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, step_benchmark);
criterion_main!(benches);
