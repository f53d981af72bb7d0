mod common;

use std::fs::{self, File};
use std::io::Read;

use approx::assert_abs_diff_eq;
use serde_json::json;

use common::{orchestrator, TempDir};
use terrasolve::batch;
use terrasolve::case_folder;
use terrasolve::cases::{elastic_case, seepage_case, StructuredGrid};
use terrasolve::orchestrator::CancelToken;
use terrasolve::precheck::{self, Severity};
use terrasolve::registry::SolverRegistry;
use terrasolve::request::BcSpec;
use terrasolve::result::{FieldLocation, RunStatus};

#[test]
fn elastic_square_sags_under_gravity() {
    let tmp = TempDir::new("scenario-a");
    let grid = StructuredGrid::new(1.0, 1.0, 1, 1);
    let (mut request, mesh) = elastic_case(&grid);
    let stage = &mut request.stages[0];
    stage.bcs.truncate(1);
    stage.loads.clear();
    stage.num_steps = 1;
    case_folder::write_case(tmp.path(), &request, &mesh).unwrap();

    let outcome = orchestrator().run(tmp.path(), "reference_elastic", &CancelToken::new());
    assert_eq!(outcome.status, RunStatus::Success, "{:?}", outcome.error);

    let (meta, arrays) = case_folder::read_outputs(&outcome.out_dir.unwrap()).unwrap();
    let last = *arrays.steps().iter().last().unwrap();
    assert_eq!(last, meta.global_steps.len());

    // node 2 is the top-left corner of a 1x1 grid
    let u = arrays.field(FieldLocation::Node, "u", last).unwrap();
    assert!(u[[2, 1]] < 0.0);
    assert_eq!(u[[0, 0]], 0.0);
    assert_eq!(u[[0, 1]], 0.0);

    let vm = arrays.field(FieldLocation::Element, "vm", last).unwrap();
    assert_eq!(vm.len(), 2);
    assert!(vm.iter().all(|v| *v >= 0.0));
}

#[test]
fn seepage_strip_is_linear_between_heads() {
    let tmp = TempDir::new("scenario-b");
    let grid = StructuredGrid::new(10.0, 1.0, 10, 2);
    let (mut request, mesh) = seepage_case(&grid);
    let stage = &mut request.stages[0];
    stage.loads.clear();
    stage.bcs = vec![
        BcSpec {
            uid: None,
            kind: "p".into(),
            set: "left".into(),
            value: json!(100.0),
        },
        BcSpec {
            uid: None,
            kind: "p".into(),
            set: "right".into(),
            value: json!(0.0),
        },
    ];
    case_folder::write_case(tmp.path(), &request, &mesh).unwrap();

    let outcome = orchestrator().run(tmp.path(), "ref_seepage", &CancelToken::new());
    assert_eq!(outcome.status, RunStatus::Success, "{:?}", outcome.error);

    let (_, arrays) = case_folder::read_outputs(&outcome.out_dir.unwrap()).unwrap();
    let last = *arrays.steps().iter().last().unwrap();
    let p = arrays.field(FieldLocation::Node, "p", last).unwrap();
    for (node, point) in mesh.points().iter().enumerate() {
        let expected = 100.0 * (1.0 - point[0] / 10.0);
        assert_abs_diff_eq!(p[node], expected, epsilon = 1e-6);
    }
}

#[test]
fn missing_bc_set_blocks_the_run() {
    let tmp = TempDir::new("scenario-c");
    let (mut request, mesh) = elastic_case(&StructuredGrid::new(2.0, 1.0, 2, 1));
    request.stages[0].bcs[1].set = "nonexistent".into();

    let registry = SolverRegistry::new();
    let caps = registry.capabilities("reference_elastic").unwrap();
    let issues = precheck::validate(&request, &mesh, Some(&caps));
    let errors: Vec<_> = issues.iter().filter(|i| i.severity == Severity::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "BC_SET_MISSING");

    case_folder::write_case(tmp.path(), &request, &mesh).unwrap();
    let outcome = orchestrator().run(tmp.path(), "reference_elastic", &CancelToken::new());
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error_code(), Some("PRECHECK"));
    assert!(!case_folder::out_dir(tmp.path()).exists());
}

#[test]
fn batch_continues_past_a_broken_case() {
    let tmp = TempDir::new("scenario-d");
    let grid = StructuredGrid::new(2.0, 1.0, 2, 1);
    for name in ["case_a", "case_b"] {
        let (request, mesh) = elastic_case(&grid);
        case_folder::write_case(&tmp.path().join(name), &request, &mesh).unwrap();
    }
    let (mut request, mesh) = elastic_case(&grid);
    request.assignments[0].material_id = "mat_missing".into();
    case_folder::write_case(&tmp.path().join("case_c"), &request, &mesh).unwrap();

    let cases = batch::discover_case_folders(tmp.path()).unwrap();
    assert_eq!(cases.len(), 3);
    let records = batch::run_many(
        &orchestrator(),
        &cases,
        "reference_elastic",
        None,
        &CancelToken::new(),
        |_, _, _, _| {},
    );

    let report = tmp.path().join("batch_report.json");
    batch::write_report(&records, &report).unwrap();
    let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    let statuses: Vec<&str> = value["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["success", "success", "failed"]);
    assert_eq!(value["records"][2]["error_code"], "SOLVER_RUNTIME");
}

#[test]
fn singular_system_produces_a_bundle() {
    let tmp = TempDir::new("scenario-e");
    let (mut request, mesh) = elastic_case(&StructuredGrid::new(2.0, 1.0, 2, 1));
    request.stages[0].bcs.clear();
    case_folder::write_case(tmp.path(), &request, &mesh).unwrap();

    let outcome = orchestrator().run(tmp.path(), "reference_elastic", &CancelToken::new());
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error_code(), Some("SOLVER_SINGULAR"));

    let zip_path = outcome.diagnostics.unwrap().zip_path;
    let mut archive = zip::ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
    let names: Vec<String> = archive.file_names().map(str::to_owned).collect();
    for expected in ["diag/traceback.txt", "case/request.json", "case/mesh.npz"] {
        assert!(names.iter().any(|n| n == expected), "{expected} missing from {names:?}");
    }

    let mut traceback = String::new();
    archive
        .by_name("diag/traceback.txt")
        .unwrap()
        .read_to_string(&mut traceback)
        .unwrap();
    assert!(!traceback.is_empty());

    let mut bundled = Vec::new();
    archive.by_name("case/request.json").unwrap().read_to_end(&mut bundled).unwrap();
    assert_eq!(bundled, fs::read(tmp.path().join("request.json")).unwrap());
}
