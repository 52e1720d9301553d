use geo_types::Coord;
use nalgebra::Point3;
use ndarray::Array2;

use treecrown::{
    boundary,
    geom::Direction,
    raster::{BoundingBox, ElevationGrid},
    sampling::{self, CrownPart, SamplingScheme},
    settings, CrownError, PoissonPipeline, Stage, Tree, TreeParams,
};

// Tolerance for comparing reconstructed lengths
const TOL: f64 = 1e-9;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn asymmetric_tree() -> Tree {
    Tree::new(
        TreeParams::new("PSME", 0.45, 18.0, 250.0, 400.0)
            .with_ground_elevation(1200.0)
            .with_crown_base_height(5.0)
            .with_crown_radii([3.0, 3.5, 2.5, 3.2])
            .with_crown_edge_heights([9.0; 4])
            .with_crown_shapes([[1.5, 2.0], [2.0, 1.0], [1.0, 1.0], [0.8, 2.5]])
            .with_lean(120.0, 8.0),
    )
    .unwrap()
}

#[test]
fn footprint_at_edge_height_reproduces_radii() {
    let tree = asymmetric_tree();
    let cloud = sampling::sample_crown_surface(&tree, 32, 30).unwrap();
    let edge = tree.profile(Direction::East).edge_height;

    let ring: Vec<Point3<f64>> = cloud.points.iter().copied().filter(|p| p.z == edge).collect();
    assert_eq!(ring.len(), 32);

    let footprint = boundary::peripheral_points(&ring).unwrap();
    let centre = tree.crown_center_at(edge);
    for direction in Direction::ALL {
        let (ux, uy) = direction.unit();
        let reach = footprint
            .ring
            .iter()
            .map(|c| (c.x - centre.x) * ux + (c.y - centre.y) * uy)
            .fold(f64::NEG_INFINITY, f64::max);
        let expected = tree.profile(direction).radius;
        assert!(
            (reach - expected).abs() < TOL,
            "{}: {} vs {}",
            direction,
            reach,
            expected
        );
    }
    assert!(footprint.signed_area() > 0.0);
    assert_eq!(footprint.elevations.as_ref().unwrap(), &vec![edge; footprint.len()]);
}

#[test]
fn square_corners_any_order() {
    let corners = [
        Point3::new(0.0, 10.0, 1.0),
        Point3::new(10.0, 0.0, 2.0),
        Point3::new(0.0, 0.0, 3.0),
        Point3::new(10.0, 10.0, 4.0),
    ];
    let hull = boundary::peripheral_points(&corners).unwrap();
    assert_eq!(
        hull.ring,
        vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 10.0, y: 0.0 },
            Coord { x: 10.0, y: 10.0 },
            Coord { x: 0.0, y: 10.0 },
        ]
    );
    assert_eq!(hull.elevations, Some(vec![3.0, 2.0, 4.0, 1.0]));
    assert_eq!(
        boundary::peripheral_points(&[]).unwrap_err(),
        CrownError::EmptyPointSet
    );
}

#[test]
fn circular_plot_of_36_points() {
    let plot = boundary::circular_plot_boundary(Coord { x: 0.0, y: 0.0 }, 10.0, 36).unwrap();
    assert_eq!(plot.len(), 36);
    for (k, c) in plot.ring.iter().enumerate() {
        assert!((c.x.hypot(c.y) - 10.0).abs() < TOL);
        let angle = c.y.atan2(c.x).to_degrees();
        let expected = 90.0 + 10.0 * k as f64;
        let diff = (angle - expected).rem_euclid(360.0);
        assert!(diff < 1e-9 || diff > 360.0 - 1e-9, "vertex {} at {}", k, angle);
    }
    assert!((plot.centroid().unwrap().x).abs() < 1e-9);
}

#[test]
fn plot_clipped_to_raster_extent() {
    let extent = BoundingBox::new(0.0, 0.0, 100.0, 100.0).unwrap();
    let raster = boundary::raster_bbox_as_polygon(&extent).unwrap();
    let plot = boundary::circular_plot_boundary(Coord { x: 100.0, y: 50.0 }, 10.0, 72).unwrap();
    let overlap = plot.intersection(&raster);
    assert_eq!(overlap.len(), 1);
    assert!((overlap[0].area() - plot.area() / 2.0).abs() < 1e-3);
    assert!(overlap[0].ring.iter().all(|c| c.x <= 100.0 + 1e-6));
}

#[test]
fn crown_base_at_height_is_rejected_before_sampling() {
    init_logging();
    let params = TreeParams::new("PIPO", 0.3, 15.0, 0.0, 0.0)
        .with_ground_elevation(0.0)
        .with_crown_base_height(15.0);
    let err = PoissonPipeline::default().run(&params).unwrap_err();
    assert_eq!(err.stage, Stage::Geometry);
    assert!(matches!(err.source, CrownError::InvalidGeometry(_)));

    // the tree itself is constructible, the pipeline still refuses it
    let tree = Tree::new(params).unwrap();
    let err = treecrown::pipeline::poisson_pipeline(&tree, 16, 16, 4).unwrap_err();
    assert_eq!(err.stage, Stage::Geometry);
}

#[test]
fn pipeline_reads_ground_from_raster() {
    init_logging();
    let raster = ElevationGrid::new(
        Array2::from_elem((10, 10), 350.0),
        BoundingBox::new(0.0, 0.0, 100.0, 100.0).unwrap(),
    )
    .unwrap();
    let params = TreeParams::new("TSHE", 0.4, 16.0, 40.0, 60.0)
        .with_crown_ratio(0.6)
        .with_crown_radii([2.5, 3.0, 2.0, 2.8]);
    let pipeline = PoissonPipeline::with_resolution(32, 30, 5);
    let mesh = pipeline.run_on(&params, &raster).unwrap();
    assert!(mesh.is_watertight());
    let lowest = mesh
        .vertices
        .iter()
        .map(|v| v.z)
        .fold(f64::INFINITY, f64::min);
    assert!(lowest > 350.0);

    let outside = TreeParams {
        stem_x: 500.0,
        ..params
    };
    let err = pipeline.run_on(&outside, &raster).unwrap_err();
    assert_eq!(err.stage, Stage::Geometry);
    assert!(matches!(err.source, CrownError::OutOfBounds { .. }));
}

#[test]
fn tree_list_records_from_json() {
    let record = r#"{
        "species": "PSME",
        "dbh": 0.52,
        "height": 21.0,
        "stem_x": 12.0,
        "stem_y": -7.5,
        "stem_z": 98.0,
        "crown_radii": [3.1, 2.9, 3.4, 3.0],
        "lean_direction": 45.0,
        "lean_severity": 4.0
    }"#;
    let params: TreeParams = serde_json::from_str(record).unwrap();
    assert_eq!(params.crown_shapes, [[1.0, 1.0]; 4]);
    let tree = Tree::new(params).unwrap();
    assert!((tree.crown_ratio() - 0.65).abs() < 1e-12);
    assert!(tree.crown_apex_and_base().0.x > 12.0);

    let stem = sampling::sample_stem_surface(&tree, 12).unwrap();
    assert!(stem.points.iter().all(|p| p.z <= tree.base_z() + TOL));
}

#[test]
fn scattered_top_only_cloud() {
    let tree = asymmetric_tree();
    let scheme = SamplingScheme::Scattered {
        count: 400,
        noise_sigma: 0.0,
        seed: 42,
    };
    let cloud = sampling::sample_crown(&tree, 16, 16, &scheme, CrownPart::TopOnly).unwrap();
    let edge = tree.profile(Direction::North).edge_height;
    assert_eq!(cloud.len(), 401);
    assert!(cloud.points.iter().all(|p| p.z >= edge));
}

#[test]
fn batch_keeps_input_order() {
    init_logging();
    let good = TreeParams::new("PSME", 0.5, 14.0, 0.0, 0.0)
        .with_ground_elevation(10.0)
        .with_crown_base_height(4.0)
        .with_crown_radii([3.0, 2.5, 2.8, 3.3]);
    let bad = TreeParams {
        crown_radii: [3.0, -1.0, 2.0, 2.0],
        ..good.clone()
    };
    let shifted = TreeParams {
        stem_x: 30.0,
        ..good.clone()
    };

    let results = PoissonPipeline::with_resolution(32, 30, 5).run_batch(&[good, bad, shifted]);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().stage, Stage::Geometry);
    let first = results[0].as_ref().unwrap();
    let third = results[2].as_ref().unwrap();
    assert!((third.volume() - first.volume()).abs() / first.volume() < 1e-6);
    assert!(third.vertices[0].x > 20.0);
}

#[test]
fn configured_pipeline_from_default_file() {
    let mut settings = settings::load_default_config().unwrap();
    settings.poisson.depth = 5;
    settings.poisson.trim_quantile = Some(0.02);
    let pipeline = PoissonPipeline::new(settings);
    let mesh = pipeline.run_tree(&asymmetric_tree()).unwrap();
    assert!(mesh.volume() > 0.0);
    assert_eq!(mesh.config.trim_quantile, Some(0.02));
}

fn volume_error(params: TreeParams, depth: u32) -> Result<f64, treecrown::PipelineError> {
    let tree = Tree::new(params).unwrap();
    let mesh = PoissonPipeline::with_resolution(32, 30, depth).run_tree(&tree)?;
    Ok((mesh.volume() - tree.crown_volume()).abs() / tree.crown_volume())
}

#[test]
fn reconstructed_volume_matches_crown_volume() {
    init_logging();
    let base = TreeParams::new("PSME", 0.5, 20.0, 0.0, 0.0)
        .with_ground_elevation(0.0)
        .with_crown_radii([5.0; 4]);

    for shape in [1.0, 2.0, 3.0] {
        for lean in [0.0, 45.0, 70.0] {
            let params = base
                .clone()
                .with_crown_shapes([[shape, shape]; 4])
                .with_lean(30.0, lean);
            let error = volume_error(params, 5)
                .unwrap_or_else(|e| panic!("shape {} lean {}: {}", shape, lean, e));
            assert!(error < 0.15, "shape {} lean {}: {}", shape, lean, error);
        }
    }

    for lean in [0.0, 45.0, 70.0] {
        let params = base
            .clone()
            .with_crown_shapes([[0.7, 0.7]; 4])
            .with_lean(30.0, lean);
        let error = volume_error(params, 6).unwrap_or_else(|e| panic!("lean {}: {}", lean, e));
        assert!(error < 0.2, "lean {}: {}", lean, error);
    }

    // too thin for the grid: rejected, never a wrong mesh
    let params = base.with_crown_shapes([[0.3, 0.3]; 4]);
    match volume_error(params, 6) {
        Ok(error) => assert!(error < 0.25),
        Err(e) => {
            assert_eq!(e.stage, Stage::Reconstruction);
            assert!(matches!(
                e.source,
                CrownError::VolumeMismatch { .. } | CrownError::EmptySurface
            ));
        }
    }
}
