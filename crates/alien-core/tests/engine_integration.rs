use alien_core::{
    CellChange, DataChange, DataTransfer, DeviceKind, EngineError, ExecutionSettings, Float2,
    InitialCapacity, OverlayKind, ParticleChange, Rect, SelectionState, Settings,
    ShallowUpdate, SimulationEngine, SimulationParameters, WorldSize,
};

fn small_world() -> Settings {
    Settings {
        world_size: WorldSize::new(10, 10),
        ..Settings::default()
    }
}

fn engine_with(settings: Settings, data: &DataTransfer) -> SimulationEngine {
    let mut engine = SimulationEngine::new(0, settings).expect("engine");
    engine.set_data(data).expect("set data");
    engine
}

fn everything() -> Rect {
    Rect::new(Float2::ZERO, Float2::new(10.0, 10.0))
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}

#[test]
fn lone_particle_stays_put_and_is_indexed() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(5.0, 5.0), Float2::ZERO, 10.0);
    let mut engine = engine_with(small_world(), &data);

    engine.calc_timestep().expect("step");

    let found = engine
        .particle_at(Float2::new(5.0, 5.0))
        .expect("particle indexed at its cell");
    assert_eq!(found.pos, Float2::new(5.0, 5.0));
    assert_eq!(found.energy, 10.0);
    assert_eq!(engine.population().particles, 1);
}

#[test]
fn colliding_particles_merge_with_energy_weighted_velocity() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(4.5, 5.5), Float2::new(1.0, 0.0), 4.0);
    data.add_particle(Float2::new(6.5, 5.5), Float2::new(-1.0, 0.0), 6.0);
    let mut engine = engine_with(small_world(), &data);

    let events = engine.calc_timestep().expect("step");
    assert_eq!(events.merges, 1);

    let snapshot = engine.get_data(everything()).expect("export");
    assert_eq!(snapshot.particles.len(), 1);
    let survivor = &snapshot.particles[0];
    assert_eq!(survivor.energy, 10.0);
    assert!(close(survivor.vel.x, -0.2), "vx = {}", survivor.vel.x);

    let monitor = engine.monitor_data().expect("monitor");
    assert_eq!(monitor.processes.successful_merges, 1);
    assert!((monitor.total_energy - 10.0).abs() < 1e-4);
}

#[test]
fn replacing_the_world_starts_fresh_counters() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(4.5, 5.5), Float2::new(1.0, 0.0), 4.0);
    data.add_particle(Float2::new(6.5, 5.5), Float2::new(-1.0, 0.0), 6.0);
    let mut engine = engine_with(small_world(), &data);
    engine.calc_timestep().expect("step");
    assert_eq!(engine.monitor_data().expect("monitor").processes.successful_merges, 1);

    let mut lone = DataTransfer::default();
    lone.add_particle(Float2::new(2.0, 2.0), Float2::ZERO, 3.0);
    engine.set_data(&lone).expect("replace");
    let monitor = engine.monitor_data().expect("monitor");
    assert_eq!(monitor.processes, Default::default());
    assert_eq!(monitor.num_particles, 1);
}

#[test]
fn duplicate_ids_are_rejected_on_import() {
    let mut data = DataTransfer::default();
    let a = data.add_particle(Float2::new(1.0, 1.0), Float2::ZERO, 1.0);
    let b = data.add_particle(Float2::new(8.0, 8.0), Float2::ZERO, 1.0);
    data.particles[a].id = 42;
    data.particles[b].id = 42;
    let mut engine = SimulationEngine::new(0, small_world()).expect("engine");
    assert!(matches!(engine.set_data(&data), Err(EngineError::InvalidData(_))));
    assert_eq!(engine.population().particles, 0);
}

#[test]
fn execution_settings_can_change_between_steps() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(1.5, 1.5), Float2::new(1.0, 0.0), 5.0);
    data.add_particle(Float2::new(7.5, 7.5), Float2::ZERO, 5.0);
    let mut engine = engine_with(small_world(), &data);
    engine.calc_timesteps(3).expect("steps on the pool");

    let serial = ExecutionSettings {
        device: DeviceKind::Serial,
        work_group_size: 8,
        ..ExecutionSettings::default()
    };
    engine.set_execution_settings(serial.clone()).expect("switch device");
    assert_eq!(engine.settings().execution, serial);
    engine.calc_timesteps(2).expect("steps on the serial device");

    assert_eq!(engine.current_timestep(), 5);
    assert_eq!(engine.population().particles, 2);
    let moved = engine.particle_at(Float2::new(6.5, 1.5)).expect("moved five cells");
    assert_eq!(moved.energy, 5.0);

    let bad = ExecutionSettings {
        capacity_growth_factor: 1.0,
        ..ExecutionSettings::default()
    };
    assert!(matches!(
        engine.set_execution_settings(bad),
        Err(EngineError::Config(_))
    ));
    let no_lanes = ExecutionSettings {
        work_group_size: 0,
        ..ExecutionSettings::default()
    };
    assert!(matches!(
        engine.set_execution_settings(no_lanes),
        Err(EngineError::EnvironmentUnavailable(_))
    ));
    assert_eq!(engine.settings().execution, serial, "failed swaps keep the old device");
    engine.calc_timestep().expect("still steps");
}

#[test]
fn empty_region_exports_nothing() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(8.0, 8.0), Float2::ZERO, 1.0);
    let mut engine = engine_with(small_world(), &data);

    let region = engine
        .get_data(Rect::new(Float2::new(1.0, 1.0), Float2::new(2.0, 2.0)))
        .expect("export");
    let counts = region.counts();
    assert_eq!((counts.cells, counts.particles, counts.tokens), (0, 0, 0));
    assert!(region.is_empty());
}

#[test]
fn oversized_import_grows_once() {
    let settings = Settings {
        capacity: InitialCapacity {
            particles: 8,
            ..InitialCapacity::default()
        },
        ..Settings::default()
    };
    let mut initial = DataTransfer::default();
    for i in 0..4 {
        initial.add_particle(Float2::new(10.0 * i as f32, 5.0), Float2::ZERO, 1.0);
    }
    let mut engine = engine_with(settings, &initial);

    let mut batch = DataTransfer::default();
    for i in 0..20 {
        batch.add_particle(Float2::new(10.0 * i as f32, 50.0), Float2::ZERO, 1.0);
    }
    let population = engine.add_data(&batch, false).expect("import");

    assert_eq!(population.particles, 24);
    assert_eq!(engine.capacity_growths(), 1);
    assert!(engine.capacities().particles >= 24);
}

#[test]
fn energetic_particle_becomes_a_cell() {
    let settings = Settings {
        parameters: SimulationParameters {
            particle_transformation_probability: 1.0,
            ..SimulationParameters::default()
        },
        ..small_world()
    };
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(3.0, 3.0), Float2::ZERO, 200.0);
    let mut engine = engine_with(settings, &data);

    engine.calc_timestep().expect("step");

    let population = engine.population();
    assert_eq!((population.cells, population.particles), (1, 0));
    let monitor = engine.monitor_data().expect("monitor");
    assert_eq!(monitor.processes.created_cells, 1);
    assert!((monitor.total_energy - 200.0).abs() < 1e-3);
}

#[test]
fn cell_absorbs_particle_in_its_grid_cell() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(5.5, 5.5), Float2::ZERO, 100.0);
    data.add_particle(Float2::new(5.2, 5.3), Float2::ZERO, 5.0);
    let mut engine = engine_with(small_world(), &data);

    let events = engine.calc_timestep().expect("step");
    assert_eq!(events.absorptions, 1);

    let snapshot = engine.get_data(everything()).expect("export");
    assert!(snapshot.particles.is_empty());
    assert_eq!(snapshot.cells[0].energy, 105.0);
    assert_eq!(engine.monitor_data().expect("monitor").processes.absorptions, 1);
}

#[test]
fn starving_cell_decays_into_a_particle() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(2.5, 2.5), Float2::ZERO, 30.0);
    let mut engine = engine_with(small_world(), &data);

    engine.calc_timestep().expect("step");

    let snapshot = engine.get_data(everything()).expect("export");
    assert!(snapshot.cells.is_empty());
    assert_eq!(snapshot.particles.len(), 1);
    assert_eq!(snapshot.particles[0].energy, 30.0);
    assert_eq!(engine.monitor_data().expect("monitor").processes.decays, 1);
}

#[test]
fn full_cell_arena_grows_at_the_check_interval() {
    let settings = Settings {
        parameters: SimulationParameters {
            particle_transformation_probability: 1.0,
            ..SimulationParameters::default()
        },
        capacity: InitialCapacity {
            cells: 1,
            ..InitialCapacity::default()
        },
        ..small_world()
    };
    let mut data = DataTransfer::default();
    for offset in [1.5, 3.5, 5.5, 7.5] {
        data.add_particle(Float2::new(offset, offset), Float2::ZERO, 200.0);
    }
    let mut engine = engine_with(settings, &data);

    engine.calc_timesteps(9).expect("steps");
    assert_eq!(engine.capacities().cells, 1, "no growth before the check");
    assert_eq!(engine.population().cells, 1);

    engine.calc_timestep().expect("step 10");
    assert_eq!(engine.capacities().cells, 2);

    engine.calc_timesteps(11).expect("steps");
    let population = engine.population();
    assert_eq!((population.cells, population.particles), (4, 0));
    assert_eq!(engine.capacity_growths(), 2);
    let monitor = engine.monitor_data().expect("monitor");
    assert!((monitor.total_energy - 800.0).abs() < 1e-3, "energy conserved");
}

#[test]
fn selection_follows_clusters() {
    let mut data = DataTransfer::default();
    let a = data.add_cell(Float2::new(2.2, 2.5), Float2::ZERO, 100.0);
    let b = data.add_cell(Float2::new(3.0, 2.5), Float2::ZERO, 100.0);
    data.add_cell(Float2::new(7.5, 7.5), Float2::ZERO, 100.0);
    assert!(data.connect(a, b));
    let mut engine = engine_with(small_world(), &data);

    engine
        .set_selection(Rect::new(Float2::new(2.0, 2.0), Float2::new(2.5, 3.0)))
        .expect("select");
    let summary = engine.selection_shallow_data().expect("summary");
    assert_eq!((summary.num_cells, summary.num_cluster_cells), (1, 1));

    let direct = engine.get_selected_data(false).expect("export");
    assert_eq!(direct.cells.len(), 1);
    assert_eq!(direct.cells[0].num_connections, 0, "edge to unexported cell dropped");

    let cluster = engine.get_selected_data(true).expect("export");
    assert_eq!(cluster.cells.len(), 2);
    assert_eq!(cluster.cells[1].selected, SelectionState::ClusterSelected);
    assert_eq!(cluster.cells[0].connections()[0].cell, 1);

    engine.recolor_selected(4, true).expect("recolor");
    assert_eq!(engine.monitor_data().expect("monitor").num_cells_by_color[4], 2);

    engine.remove_selected(true).expect("remove");
    assert_eq!(engine.population().cells, 1);
}

#[test]
fn point_selection_switches_and_swaps() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(2.0, 2.0), Float2::ZERO, 1.0);
    data.add_particle(Float2::new(7.0, 7.0), Float2::ZERO, 1.0);
    let mut engine = engine_with(small_world(), &data);

    engine.switch_selection(Float2::new(2.1, 2.0), 0.5).expect("switch");
    engine.swap_selection(Float2::new(7.0, 7.1), 0.5).expect("swap");
    assert_eq!(engine.selection_shallow_data().expect("summary").num_particles, 2);

    engine.swap_selection(Float2::new(2.0, 2.0), 0.5).expect("swap");
    let selected = engine.get_selected_data(false).expect("export");
    assert_eq!(selected.particles.len(), 1);
    assert_eq!(selected.particles[0].pos, Float2::new(7.0, 7.0));

    engine.switch_selection(Float2::new(2.0, 2.0), 0.5).expect("switch");
    let selected = engine.get_selected_data(false).expect("export");
    assert_eq!(selected.particles[0].pos, Float2::new(2.0, 2.0));

    engine.remove_selection().expect("clear");
    assert_eq!(engine.selection_shallow_data().expect("summary").num_particles, 0);
}

#[test]
fn velocity_edits_apply_to_the_selection() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(2.0, 2.0), Float2::new(1.0, 0.0), 1.0);
    data.add_particle(Float2::new(7.0, 7.0), Float2::new(0.0, 1.0), 1.0);
    let mut engine = engine_with(small_world(), &data);

    engine.set_selection(everything()).expect("select");
    engine.uniform_velocity_selected(false).expect("uniform");
    let snapshot = engine.get_data(everything()).expect("export");
    assert!(
        snapshot
            .particles
            .iter()
            .all(|p| close(p.vel.x, 0.5) && close(p.vel.y, 0.5))
    );

    engine
        .apply_force_selected(Float2::new(-0.5, 0.0), false)
        .expect("force");
    engine.calc_timestep().expect("step");
    let snapshot = engine.get_data(everything()).expect("export");
    let first = snapshot
        .particles
        .iter()
        .find(|p| close(p.pos.x, 2.0))
        .expect("first particle only drifts along y");
    assert!(close(first.pos.y, 2.5));
}

#[test]
fn shallow_update_moves_the_selection() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(2.0, 2.0), Float2::ZERO, 1.0);
    let mut engine = engine_with(small_world(), &data);
    engine.switch_selection(Float2::new(2.0, 2.0), 0.5).expect("select");

    engine
        .shallow_update_selected(ShallowUpdate {
            position_delta: Float2::new(1.0, 0.0),
            velocity_delta: Float2::new(0.0, 0.25),
            ..ShallowUpdate::default()
        })
        .expect("update");

    let particle = engine.particle_at(Float2::new(3.0, 2.0)).expect("moved");
    assert_eq!(particle.pos, Float2::new(3.0, 2.0));
    assert!(close(particle.vel.y, 0.25));
}

#[test]
fn relax_resets_rest_lengths() {
    let mut data = DataTransfer::default();
    let a = data.add_cell(Float2::new(2.0, 2.5), Float2::ZERO, 100.0);
    let b = data.add_cell(Float2::new(2.8, 2.5), Float2::ZERO, 100.0);
    assert!(data.connect(a, b));
    let mut engine = engine_with(small_world(), &data);

    let ids: Vec<u64> = engine
        .get_data(everything())
        .expect("export")
        .cells
        .iter()
        .map(|c| c.id)
        .collect();
    engine
        .change_data(&DataChange {
            cells: vec![CellChange {
                id: ids[1],
                pos: Some(Float2::new(3.5, 2.5)),
                ..CellChange::default()
            }],
            ..DataChange::default()
        })
        .expect("change");

    engine.switch_selection(Float2::new(2.0, 2.5), 0.3).expect("select");
    engine.relax_selected(true).expect("relax");

    let cluster = engine.get_selected_data(true).expect("export");
    assert_eq!(cluster.cells.len(), 2);
    for cell in &cluster.cells {
        assert!(close(cell.connections()[0].distance, 1.5));
    }
}

#[test]
fn reconnect_links_nearby_selected_cells() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(5.2, 5.5), Float2::ZERO, 100.0);
    data.add_cell(Float2::new(5.7, 5.5), Float2::ZERO, 100.0);
    data.add_cell(Float2::new(8.5, 8.5), Float2::ZERO, 100.0);
    let mut engine = engine_with(small_world(), &data);

    engine.set_selection(everything()).expect("select");
    engine.reconnect_selected(false).expect("reconnect");

    assert_eq!(engine.monitor_data().expect("monitor").num_connections, 1);
}

#[test]
fn sticky_cell_fuses_during_a_step() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(5.2, 5.5), Float2::ZERO, 100.0);
    data.add_cell(Float2::new(5.9, 5.5), Float2::ZERO, 100.0);
    let mut engine = engine_with(small_world(), &data);

    engine.switch_selection(Float2::new(5.2, 5.5), 0.2).expect("select");
    engine.make_sticky(false).expect("sticky");
    let events = engine.calc_timestep().expect("step");

    assert_eq!(events.fusions, 1);
    let monitor = engine.monitor_data().expect("monitor");
    assert_eq!(monitor.num_connections, 1);
    assert_eq!(monitor.processes.fusions, 1);

    engine.remove_sticky(false).expect("unsticky");
    let selected = engine.get_selected_data(false).expect("export");
    assert!(!selected.cells[0].sticky);
}

#[test]
fn barrier_cells_hold_still() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(5.0, 5.0), Float2::new(1.0, 0.0), 100.0);
    data.add_cell(Float2::new(2.0, 2.0), Float2::new(1.0, 0.0), 100.0);
    let mut engine = engine_with(small_world(), &data);

    engine.switch_selection(Float2::new(5.0, 5.0), 0.2).expect("select");
    engine.set_barrier(true, false).expect("barrier");
    engine.calc_timestep().expect("step");

    let snapshot = engine.get_data(everything()).expect("export");
    let wall = snapshot.cells.iter().find(|c| c.barrier).expect("barrier cell");
    assert_eq!(wall.pos, Float2::new(5.0, 5.0));
    let mover = snapshot.cells.iter().find(|c| !c.barrier).expect("free cell");
    assert!(close(mover.pos.x, 3.0));
}

#[test]
fn change_data_edits_known_ids_and_skips_unknown_ones() {
    let mut data = DataTransfer::default();
    data.add_particle(Float2::new(2.0, 2.0), Float2::ZERO, 1.0);
    let cell = data.add_cell(Float2::new(6.5, 6.5), Float2::ZERO, 100.0);
    data.set_cell_name(cell, "seed");
    let mut engine = engine_with(small_world(), &data);

    let before = engine.get_data(everything()).expect("export");
    let change = DataChange {
        cells: vec![CellChange {
            id: before.cells[0].id,
            name: Some("sprout".to_string()),
            energy: Some(150.0),
            ..CellChange::default()
        }],
        particles: vec![
            ParticleChange {
                id: before.particles[0].id,
                pos: Some(Float2::new(11.0, 1.0)),
                energy: Some(42.0),
                ..ParticleChange::default()
            },
            ParticleChange {
                id: 9_999,
                energy: Some(1.0),
                ..ParticleChange::default()
            },
        ],
    };
    engine.change_data(&change).expect("change");

    let after = engine.get_data(everything()).expect("export");
    assert_eq!(after.particles[0].energy, 42.0);
    assert_eq!(after.particles[0].pos, Float2::new(1.0, 1.0), "position wrapped");
    assert_eq!(after.cells[0].energy, 150.0);
    assert_eq!(after.cell_name(&after.cells[0]), Some("sprout"));
}

#[test]
fn inspected_data_respects_the_id_bound() {
    let mut data = DataTransfer::default();
    for x in [1.0, 4.0, 7.0] {
        data.add_particle(Float2::new(x, 1.0), Float2::ZERO, 1.0);
    }
    let mut engine = engine_with(small_world(), &data);
    let ids: Vec<u64> = engine
        .get_data(everything())
        .expect("export")
        .particles
        .iter()
        .map(|p| p.id)
        .collect();

    let bounded = engine.get_inspected_data(&ids, 2).expect("inspect");
    assert_eq!(bounded.particles.len(), 2);
    let all = engine.get_inspected_data(&ids, 10).expect("inspect");
    assert_eq!(all.particles.len(), 3);
    let none = engine.get_inspected_data(&[12_345], 10).expect("inspect");
    assert!(none.is_empty());
}

#[test]
fn overlay_lists_entities_in_region() {
    let mut data = DataTransfer::default();
    data.add_cell(Float2::new(1.5, 1.5), Float2::ZERO, 100.0);
    data.add_particle(Float2::new(2.5, 2.5), Float2::ZERO, 1.0);
    data.add_particle(Float2::new(8.5, 8.5), Float2::ZERO, 1.0);
    let mut engine = engine_with(small_world(), &data);

    let overlay = engine
        .get_overlay_data(Rect::new(Float2::ZERO, Float2::new(5.0, 5.0)))
        .expect("overlay");
    assert_eq!(overlay.len(), 2);
    assert_eq!(overlay[0].kind, OverlayKind::Cell);
    assert_eq!(overlay[1].kind, OverlayKind::Particle);
}

#[test]
fn export_larger_than_transfer_buffer_succeeds() {
    let settings = Settings {
        capacity: InitialCapacity {
            transfer: 2,
            ..InitialCapacity::default()
        },
        ..small_world()
    };
    let mut data = DataTransfer::default();
    for i in 0..9 {
        data.add_particle(Float2::new(i as f32 + 0.5, 0.5), Float2::ZERO, 1.0);
    }
    let mut engine = engine_with(settings, &data);

    let snapshot = engine.get_data(everything()).expect("export");
    assert_eq!(snapshot.particles.len(), 9);
    assert!(engine.capacities().transfer >= 9);
}

#[test]
fn imported_ids_are_kept_and_fresh_ids_avoid_them() {
    let mut data = DataTransfer::default();
    let offset = data.add_particle(Float2::new(1.0, 1.0), Float2::ZERO, 1.0);
    data.particles[offset].id = 77;
    let mut engine = engine_with(small_world(), &data);

    let mut more = DataTransfer::default();
    more.add_particle(Float2::new(2.0, 2.0), Float2::ZERO, 1.0);
    engine.add_data(&more, true).expect("append");

    let selected = engine.get_selected_data(false).expect("export");
    assert_eq!(selected.particles.len(), 1);
    assert!(selected.particles[0].id > 77);
    let all = engine.get_data(everything()).expect("export");
    assert!(all.particles.iter().any(|p| p.id == 77));
}

#[test]
fn timestep_can_be_read_and_restored() {
    let mut engine = SimulationEngine::new(5, small_world()).expect("engine");
    assert_eq!(engine.current_timestep(), 5);
    engine.calc_timestep().expect("step");
    assert_eq!(engine.current_timestep(), 6);
    engine.set_current_timestep(100);
    assert_eq!(engine.current_timestep(), 100);
    assert_eq!(engine.monitor_data().expect("monitor").timestep, 100);
}

#[test]
fn zero_work_group_size_is_an_environment_error() {
    let settings = Settings {
        execution: ExecutionSettings {
            work_group_size: 0,
            ..ExecutionSettings::default()
        },
        ..small_world()
    };
    let err = SimulationEngine::new(0, settings).expect_err("no device");
    assert!(matches!(err, EngineError::EnvironmentUnavailable(_)));
    assert!(err.is_fatal());
}

#[test]
fn invalid_parameters_are_rejected_without_side_effects() {
    let mut engine = SimulationEngine::new(0, small_world()).expect("engine");
    let bad = SimulationParameters {
        max_velocity: -1.0,
        ..SimulationParameters::default()
    };
    assert!(matches!(
        engine.set_simulation_parameters(bad),
        Err(EngineError::Config(_))
    ));
    assert_eq!(engine.settings().parameters.max_velocity, 2.0);

    let layered = SimulationParameters {
        map_layers: 4,
        ..SimulationParameters::default()
    };
    engine.set_simulation_parameters(layered).expect("reshape");
    assert_eq!(engine.settings().parameters.map_layers, 4);
}
