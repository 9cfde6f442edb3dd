use approx::assert_relative_eq;
use bone_hfe::fabric::FabricField;
use bone_hfe::homogenize::simulated_bmc;
use bone_hfe::image::scanner_log;
use bone_hfe::{
    load_aim, resolve_fabric, round_trip, run_pipeline, save_aim, AimImage, AimVersion, FabricFields, FabricStats,
    HexMeshGenerator, HfeConfig, Homogenizer, NoProgress, PhaseKind, PixelFormat, SpecimenContext, SpecimenInputs,
    SpecimenPaths, Volume,
};
use nalgebra::{Matrix3, Vector3};

const DIMS: [usize; 3] = [20, 20, 8];
const SPACING: f64 = 0.25;

/// Square tube: cortical wall around a trabecular core, bone in plates.
/// Everything beyond x or y = 14 voxels is empty.
fn tube_volumes() -> [Volume<i16>; 4] {
    let spacing = Vector3::new(SPACING, SPACING, SPACING);
    let mut density = Volume::new(DIMS, spacing);
    let mut seg = Volume::new(DIMS, spacing);
    let mut cort = Volume::new(DIMS, spacing);
    let mut trab = Volume::new(DIMS, spacing);
    for z in 0..DIMS[2] {
        for y in 2..14 {
            for x in 2..14 {
                density.set(x, y, z, 6000);
                let core = (5..11).contains(&x) && (5..11).contains(&y);
                if core {
                    trab.set(x, y, z, 1);
                } else {
                    cort.set(x, y, z, 1);
                }
                if z % 3 != 2 {
                    seg.set(x, y, z, if core { 126 } else { 127 });
                }
            }
        }
    }
    [density, seg, cort, trab]
}

fn tube() -> SpecimenInputs {
    let spacing = Vector3::new(SPACING, SPACING, SPACING);
    let log = scanner_log(DIMS, spacing, 8192.0, 1600.0, -400.0);
    let [density, seg, cort, trab] = tube_volumes().map(|v| AimImage::new(v, PixelFormat::Short, log.clone()));
    SpecimenInputs {
        density,
        segmentation: seg,
        cortical_mask: cort,
        trabecular_mask: trab,
        common_region: None,
    }
}

fn config() -> HfeConfig {
    let mut config = HfeConfig::default();
    config.mesh.element_size_mm = 1.0;
    config.fabric.kernel_size_cortical = 3;
    config.fabric.kernel_size_trabecular = 3;
    config.homogenization.floor_bvtv = false;
    config
}

#[test]
fn test_deck_is_deterministic() {
    let inputs = tube();
    let mut first = Vec::new();
    let mut second = Vec::new();
    run_pipeline(&inputs, &config(), &NoProgress).unwrap().deck.write(&mut first).unwrap();
    run_pipeline(&inputs, &config(), &NoProgress).unwrap().deck.write(&mut second).unwrap();
    assert!(!first.is_empty());
    assert!(first == second, "decks of identical runs differ");
}

#[test]
fn test_mass_conservation_per_phase() {
    let output = run_pipeline(&tube(), &config(), &NoProgress).unwrap();
    let balance = output.summary.mass_balance.expect("mass conservation is enabled by default");
    let materials = &output.homogenization.materials;
    assert!(materials.iter().all(|m| m.rho_cortical < 1.0 && m.rho_trabecular < 1.0));

    let volume = output.summary.element_size_mm.powi(3);
    let cortical = simulated_bmc(materials.iter().map(|m| (m.rho_cortical, m.phi_cortical)), volume);
    let trabecular = simulated_bmc(materials.iter().map(|m| (m.rho_trabecular, m.phi_trabecular)), volume);
    assert!(balance.cortical.reconstructed_mg > 0.0);
    assert_relative_eq!(cortical, balance.cortical.reconstructed_mg, max_relative = 1e-9);
    assert_relative_eq!(trabecular, balance.trabecular.reconstructed_mg, max_relative = 1e-9);
}

#[test]
fn test_void_elements_are_not_written() {
    let output = run_pipeline(&tube(), &config(), &NoProgress).unwrap();
    let summary = &output.summary;
    assert_eq!(summary.grid, [5, 5, 2]);
    assert_eq!(summary.total_elements, 50);
    // Last column and row in x and y hold no bone
    assert_eq!(summary.void_elements, 18);

    let bone: Vec<usize> = output.homogenization.materials.iter().map(|m| m.element_id).collect();
    let void: Vec<usize> = output
        .mesh
        .connectivity
        .hex8_elements
        .iter()
        .map(|e| e.id)
        .filter(|id| !bone.contains(id))
        .collect();
    assert_eq!(void.len(), 18);

    let mut buf = Vec::new();
    output.deck.write(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let block: Vec<usize> = text
        .split("*ELEMENT, TYPE=C3D8, ELSET=BONE\n")
        .nth(1)
        .unwrap()
        .lines()
        .take_while(|l| !l.starts_with('*'))
        .map(|l| l.split(',').next().unwrap().trim().parse().unwrap())
        .collect();
    assert_eq!(block, bone);
    for id in &void {
        assert!(!text.contains(&format!("*ELSET, ELSET=Elset{id}\n")));
    }
}

#[test]
fn test_singular_fabric_falls_back_to_isotropic() {
    let config = config();
    let context = SpecimenContext::prepare(&tube(), &config).unwrap();
    let mesh = HexMeshGenerator::full_block(context.grid, context.element_size, [1, 255], false).unwrap();
    let fields = FabricFields {
        cortical: FabricField::zeros(context.grid),
        trabecular: FabricField::zeros(context.grid),
        stats: FabricStats::default(),
    };
    let result = Homogenizer::from_config(&config).run(&mesh, &context, &fields).unwrap();
    assert!(!result.materials.is_empty());
    assert_eq!(result.isotropic_fallbacks, result.materials.len());
    for m in &result.materials {
        assert_eq!(m.fabric.eigenvalues, Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(m.doa(), 1.0);
    }
}

#[test]
fn test_mixed_elements_keep_resolvable_phase() {
    let config = config();
    let context = SpecimenContext::prepare(&tube(), &config).unwrap();
    let mesh = HexMeshGenerator::full_block(context.grid, context.element_size, [1, 255], false).unwrap();
    let rods = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 4.0));
    let mut trabecular = FabricField::zeros(context.grid);
    trabecular.tensors.iter_mut().for_each(|t| *t = rods);
    let fields = FabricFields {
        cortical: FabricField::zeros(context.grid),
        trabecular,
        stats: FabricStats::default(),
    };
    let result = Homogenizer::from_config(&config).run(&mesh, &context, &fields).unwrap();
    let msl = resolve_fabric(&rods, 1.0).unwrap();

    let mixed: Vec<_> = result.materials.iter().filter(|m| m.kind == PhaseKind::Mixed).collect();
    assert!(!mixed.is_empty());
    for m in mixed {
        // Cortical part isotropic, trabecular part weighted by its volume fraction
        assert!(m.isotropic_fallback);
        assert!(m.doa() < 0.99, "element {} lost its trabecular anisotropy", m.element_id);
        for i in 0..3 {
            let expected = 1.0 - m.phi_trabecular + m.phi_trabecular * msl.eigenvalues[i];
            assert_relative_eq!(m.fabric.eigenvalues[i], expected, epsilon = 1e-9);
        }
        assert_relative_eq!(m.fabric.max_vector().x.abs(), 1.0, epsilon = 1e-9);
    }
    for m in result.materials.iter().filter(|m| m.kind == PhaseKind::Cortical) {
        assert!(m.isotropic_fallback);
        assert_relative_eq!(m.doa(), 1.0);
    }
}

#[test]
fn test_mesh_counts_survive_round_trip() {
    let context = SpecimenContext::prepare(&tube(), &config()).unwrap();
    let mesh = HexMeshGenerator::full_block(context.grid, context.element_size, [1, 255], true).unwrap();
    assert_eq!(mesh.num_nodes(), 6 * 6 * 3);
    assert_eq!(mesh.num_elements(), 50);
    let parsed = round_trip(&mesh).unwrap();
    assert_eq!(parsed, mesh);
}

#[test]
fn test_specimen_loads_from_aim_files() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = tube();
    let names = ["density", "seg", "cort", "trab"];
    let images = [&inputs.density, &inputs.segmentation, &inputs.cortical_mask, &inputs.trabecular_mask];
    for (image, name) in images.iter().zip(names) {
        save_aim(dir.path().join(format!("{name}.aim")), image, AimVersion::V020).unwrap();
    }

    let reread = load_aim(dir.path().join("density.aim"), Vector3::new(1.0, 1.0, 1.0)).unwrap();
    assert_eq!(reread.voxels.data, inputs.density.voxels.data);
    assert_relative_eq!(reread.spacing().x, SPACING, epsilon = 1e-9);

    let paths = SpecimenPaths {
        density: dir.path().join("density.aim"),
        segmentation: dir.path().join("seg.aim"),
        cortical_mask: dir.path().join("cort.aim"),
        trabecular_mask: dir.path().join("trab.aim"),
        common_region: None,
    };
    let loaded = SpecimenInputs::load(&paths, Vector3::new(1.0, 1.0, 1.0)).unwrap();
    assert_eq!(loaded.trabecular_mask.voxels.data, inputs.trabecular_mask.voxels.data);
    assert_eq!(loaded.segmentation.voxels.dims, DIMS);

    let output = run_pipeline(&loaded, &config(), &NoProgress).unwrap();
    assert_eq!(output.summary.void_elements, 18);
}
