use alea::io::results::read_output;
use alea::io::toydata::read_toydata;
use alea::models::GaussianModel;
use alea::parameters::ParameterDefinition;
use alea::runner::{Hypothesis, ToydataMode, update_poi};
use alea::{ParameterValues, Runner, RunnerConfig};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn values(pairs: &[(&str, f64)]) -> ParameterValues {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn gaussian_definition() -> ParameterDefinition {
    serde_yaml::from_str(
        "
mu:
  nominal_value: 0.0
  fit_limits: [-10, 10]
  parameter_interval_bounds: [-10, 10]
sigma:
  nominal_value: 1.0
  fittable: false
",
    )
    .expect("definition yaml is invalid")
}

fn gaussian_config(toydata: &Path, output: &Path) -> RunnerConfig {
    RunnerConfig {
        statistical_model: "GaussianModel".to_string(),
        poi: "mu".to_string(),
        hypotheses: vec![Hypothesis::Free, Hypothesis::Null, Hypothesis::True],
        n_mc: 5,
        generate_values: values(&[("mu", 1.0)]),
        parameter_definition: Some(gaussian_definition()),
        compute_confidence_interval: true,
        toydata_mode: ToydataMode::GenerateAndWrite,
        toydata_filename: Some(toydata.to_path_buf()),
        output_filename: Some(output.to_path_buf()),
        seed: Some(42),
        ..RunnerConfig::default()
    }
}

const BINNED_MODEL: &str = "
parameter_definition:
  signal_rate_multiplier:
    nominal_value: 1.0
    ptype: rate
    fit_limits: [0, 50]
    parameter_interval_bounds: [0, 50]
  background_rate_multiplier:
    nominal_value: 1.0
    ptype: rate
    uncertainty: 0.1
    fit_limits: [0, null]
likelihood_config:
  likelihood_terms:
    - name: science
      bin_edges: [0, 1, 2, 3]
      sources:
        - name: signal
          histogram: [1, 2, 3]
        - name: background
          histogram: [10, 10, 10]
";

#[test]
fn runner_writes_one_table_per_hypothesis() {
    let toydata = unique_temp_path("alea_runner_toydata", "json");
    let output = unique_temp_path("alea_runner_output", "json");
    let runner = Runner::new(gaussian_config(&toydata, &output)).expect("failed to build runner");
    assert_eq!(runner.result_names(), ["mu", "sigma", "ll", "dl", "ul"]);
    assert_eq!(
        runner.hypotheses_values(),
        [ParameterValues::new(), values(&[("mu", 0.0)]), values(&[("mu", 1.0)])]
    );

    let out = runner.run().expect("runner failed").expect("expected runner output");
    assert_eq!(out.results.len(), 3);
    let names: Vec<&str> = out.results.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["free", "null", "true"]);
    for table in &out.results {
        assert_eq!(table.n_rows(), 5);
        assert_eq!(table.columns, vec!["mu", "sigma", "ll", "dl", "ul"]);
    }

    let (toys, dataset_names) = read_toydata(&toydata).expect("failed to read toydata");
    assert_eq!(toys.len(), 5);
    assert_eq!(dataset_names, vec!["gaussian"]);

    let free = out.table("free").unwrap();
    let mu = free.column("mu").unwrap();
    let dl = free.column("dl").unwrap();
    let ul = free.column("ul").unwrap();
    for (i, toy) in toys.iter().enumerate() {
        let hat_mu = toy.require("gaussian").unwrap().scalar("hat_mu").unwrap();
        approx_eq(mu[i], hat_mu, 1e-4);
        approx_eq(ul[i] - mu[i], 1.644_854, 1e-3);
        approx_eq(mu[i] - dl[i], 1.644_854, 1e-3);
    }

    let null = out.table("null").unwrap();
    assert!(null.column("mu").unwrap().iter().all(|v| *v == 0.0));
    assert!(null.column("sigma").unwrap().iter().all(|v| *v == 1.0));
    assert!(null.column("ul").unwrap().iter().all(|v| v.is_nan()));
    let truth = out.table("true").unwrap();
    assert!(truth.column("mu").unwrap().iter().all(|v| *v == 1.0));

    let stored = read_output(&output).expect("failed to read output");
    assert_eq!(stored.metadata["poi"], json!("mu"));
    assert_eq!(stored.metadata["generate_values"], json!({"mu": 1.0}));
    assert!(stored.metadata.contains_key("date"));
    let stored_free = stored.table("free").unwrap();
    assert_eq!(stored_free.hypothesis_values, ParameterValues::new());
    for (a, b) in stored_free.column("mu").unwrap().iter().zip(mu.iter()) {
        approx_eq(*a, *b, 1e-12);
    }
    assert!(stored.table("null").unwrap().column("dl").unwrap().iter().all(|v| v.is_nan()));

    let _ = fs::remove_file(toydata);
    let _ = fs::remove_file(output);
}

#[test]
fn read_mode_replays_stored_toys() {
    let toydata = unique_temp_path("alea_runner_replay_toydata", "json.gz");
    let output = unique_temp_path("alea_runner_replay_output", "json");
    let mut config = gaussian_config(&toydata, &output);
    config.compute_confidence_interval = false;
    let first = Runner::new(config.clone())
        .expect("failed to build runner")
        .run()
        .expect("runner failed")
        .expect("expected runner output");

    let replay_output = unique_temp_path("alea_runner_replay_output2", "json");
    let mut replay = config.clone();
    replay.toydata_mode = ToydataMode::Read;
    replay.hypotheses = vec![Hypothesis::Free];
    replay.seed = Some(1);
    replay.output_filename = Some(replay_output.clone());
    let second = Runner::new(replay)
        .expect("failed to build runner")
        .run()
        .expect("runner failed")
        .expect("expected runner output");
    let first_mu = first.table("free").unwrap().column("mu").unwrap();
    let second_mu = second.table("free").unwrap().column("mu").unwrap();
    assert_eq!(second_mu.len(), 5);
    for (a, b) in first_mu.iter().zip(second_mu.iter()) {
        approx_eq(*a, *b, 1e-6);
    }

    let mut fewer = config.clone();
    fewer.toydata_mode = ToydataMode::Read;
    fewer.n_mc = 3;
    let truncated = Runner::new(fewer)
        .expect("failed to build runner")
        .toydata()
        .expect("reading more stored toys than n_mc should succeed");
    let (stored, _) = read_toydata(&toydata).expect("failed to read toydata");
    assert_eq!(stored.len(), 5);
    assert_eq!(truncated, stored[..3].to_vec());

    let mut too_many = config;
    too_many.toydata_mode = ToydataMode::Read;
    too_many.n_mc = 6;
    let err = Runner::new(too_many)
        .expect("failed to build runner")
        .toydata()
        .expect_err("expected too few toys");
    assert!(err.to_string().contains("less than number of Monte Carlo"));

    let _ = fs::remove_file(toydata);
    let _ = fs::remove_file(output);
    let _ = fs::remove_file(replay_output);
}

#[test]
fn seeded_generation_is_reproducible() {
    let toydata = unique_temp_path("alea_runner_seed_toydata", "json");
    let output = unique_temp_path("alea_runner_seed_output", "json");
    let mut config = gaussian_config(&toydata, &output);
    config.toydata_mode = ToydataMode::Generate;
    let a = Runner::new(config.clone()).unwrap().toydata().expect("failed to generate");
    let b = Runner::new(config.clone()).unwrap().toydata().expect("failed to generate");
    assert_eq!(a, b);
    config.seed = Some(43);
    let c = Runner::new(config).unwrap().toydata().expect("failed to generate");
    assert_ne!(a, c);
    assert!(!toydata.exists(), "generate mode must not write toydata");
}

#[test]
fn only_toydata_writes_toys_without_fitting() {
    let toydata = unique_temp_path("alea_runner_only_toydata", "json");
    let output = unique_temp_path("alea_runner_only_output", "json");
    let mut config = gaussian_config(&toydata, &output);
    config.only_toydata = true;
    let out = Runner::new(config.clone()).unwrap().run().expect("runner failed");
    assert!(out.is_none());
    assert!(!output.exists());
    let (toys, _) = read_toydata(&toydata).expect("failed to read toydata");
    assert_eq!(toys.len(), 5);

    config.toydata_mode = ToydataMode::Generate;
    let err = Runner::new(config).unwrap().run().expect_err("expected toydata mode error");
    assert!(err.to_string().contains("only_toydata is true"));

    let _ = fs::remove_file(toydata);
}

#[test]
fn no_toydata_fits_attached_data() {
    let output = unique_temp_path("alea_runner_observed_output", "json");
    let mut config = gaussian_config(Path::new("unused.json"), &output);
    config.toydata_mode = ToydataMode::NoToydata;
    config.hypotheses = vec![Hypothesis::Free];
    config.compute_confidence_interval = false;
    config.n_mc = 1;

    let runner = Runner::new(config.clone()).unwrap();
    assert!(runner.toydata().is_err());

    let mut runner = Runner::new(config).unwrap();
    runner.set_data(GaussianModel::data_from_measurement(2.0));
    let out = runner.run().expect("runner failed").expect("expected runner output");
    approx_eq(out.table("free").unwrap().column("mu").unwrap()[0], 2.0, 1e-4);

    let _ = fs::remove_file(output);
}

#[test]
fn hypotheses_are_validated() {
    let toydata = PathBuf::from("unused_toydata.json");
    let output = PathBuf::from("unused_output.json");
    let cases: Vec<(Vec<Hypothesis>, bool, &str)> = vec![
        (vec![], false, "should not be empty"),
        (vec![Hypothesis::Null, Hypothesis::Free], false, "should be the first"),
        (vec![Hypothesis::Null], true, "needed for confidence interval"),
        (
            vec![Hypothesis::Free, Hypothesis::Values(values(&[("sigma", 2.0)]))],
            false,
            "subset of the fittable",
        ),
    ];
    for (hypotheses, ci, msg) in cases {
        let mut config = gaussian_config(&toydata, &output);
        config.hypotheses = hypotheses;
        config.compute_confidence_interval = ci;
        let err = Runner::new(config).err().expect("expected hypothesis error");
        assert!(err.to_string().contains(msg), "error {err} should mention {msg}");
    }

    let mut config = gaussian_config(&toydata, &output);
    config.generate_values = ParameterValues::new();
    let err = Runner::new(config).err().expect("expected missing generate value");
    assert!(err.to_string().contains("should be provided in generate_values"));

    let mut config = gaussian_config(&toydata, &output);
    config.poi = "nu".to_string();
    let err = Runner::new(config).err().expect("expected unknown poi");
    assert!(err.to_string().contains("is not a parameter"));
}

#[test]
fn hypotheses_parse_from_json() {
    let parsed: Vec<Hypothesis> =
        serde_json::from_value(json!(["free", "null", "true", {"mu": 2.0}])).expect("failed to parse hypotheses");
    assert_eq!(
        parsed,
        vec![
            Hypothesis::Free,
            Hypothesis::Null,
            Hypothesis::True,
            Hypothesis::Values(values(&[("mu", 2.0)]))
        ]
    );
    assert_eq!(serde_json::to_value(&parsed).unwrap(), json!(["free", "null", "true", {"mu": 2.0}]));
    assert!(serde_json::from_value::<Vec<Hypothesis>>(json!(["bogus"])).is_err());
}

#[test]
fn poi_expectation_sets_rate_multiplier() {
    let model_config = unique_temp_path("alea_runner_binned_model", "yaml");
    fs::write(&model_config, BINNED_MODEL).expect("failed to write model config");
    let config = RunnerConfig {
        statistical_model: "BinnedExtendedModel".to_string(),
        poi: "signal_rate_multiplier".to_string(),
        hypotheses: vec![Hypothesis::Free, Hypothesis::True],
        generate_values: values(&[("poi_expectation", 12.0)]),
        statistical_model_config: Some(model_config.clone()),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(config.clone()).expect("failed to build runner");
    assert_eq!(runner.generate_values().len(), 1);
    approx_eq(runner.generate_values()["signal_rate_multiplier"], 2.0, 1e-12);
    assert_eq!(runner.hypotheses_values()[1], values(&[("signal_rate_multiplier", 2.0)]));

    let err = update_poi(
        runner.model(),
        "signal_rate_multiplier",
        &values(&[("poi_expectation", 12.0), ("signal_rate_multiplier", 1.0)]),
        &ParameterValues::new(),
    )
    .expect_err("expected conflicting poi error");
    assert!(err.to_string().contains("can not specify both"));

    let mut bad = config;
    bad.statistical_model = "GaussianModel".to_string();
    assert!(Runner::new(bad).is_err());

    let _ = fs::remove_file(model_config);
}

#[test]
fn model_config_file_overrides_inline_definitions() {
    let model_config = unique_temp_path("alea_runner_override_model", "yaml");
    fs::write(&model_config, BINNED_MODEL).expect("failed to write model config");
    let config = RunnerConfig {
        statistical_model: "BinnedExtendedModel".to_string(),
        poi: "signal_rate_multiplier".to_string(),
        generate_values: values(&[("signal_rate_multiplier", 1.0)]),
        statistical_model_config: Some(model_config.clone()),
        parameter_definition: Some(gaussian_definition()),
        likelihood_config: Some(json!({"likelihood_terms": []})),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(config).expect("model config should replace the inline definitions");
    assert_eq!(
        runner.model().parameter_list(),
        vec!["background_rate_multiplier", "signal_rate_multiplier"]
    );
    assert_eq!(runner.model().likelihood_names()[0], "science");

    let _ = fs::remove_file(model_config);
}
