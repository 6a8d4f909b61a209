use alea::cli::runner_config_from_args;
use alea::io::results::read_output;
use alea::sensitivity::{neyman_threshold, summarize};
use alea::submitter::{
    SubmitterConfig, arg_to_str, compute_variations, str_to_arg, update_n_batch, update_runner_args,
};
use alea::utils::{add_i_batch, format_template};
use alea::{LocalSubmitter, ParameterValues, Submit, Submitter};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&path).expect("failed to create temp dir");
    path
}

fn object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => panic!("expected a JSON object, got {other}"),
    }
}

const GAUSSIAN_MODEL: &str = "
parameter_definition:
  mu:
    nominal_value: 0.0
    fit_limits: [-10, 10]
    parameter_interval_bounds: [-10, 10]
  sigma:
    nominal_value: 1.0
    fittable: false
";

fn submitter_yaml(outputfolder: &std::path::Path, in_common: &str) -> String {
    format!(
        "
statistical_model: GaussianModel
statistical_model_config: gaussian_model.yaml
poi: mu
outputfolder: {}
computation_options:
  discovery_power:
    to_vary:
      mu: [0.0, 1.0]
    in_common:
{in_common}
",
        outputfolder.display()
    )
}

const IN_COMMON: &str = "      hypotheses: [\"free\", \"null\", \"true\"]
      n_mc: 4
      n_batch: 2
      seed: 10
      sigma: 1.0
      compute_confidence_interval: false
      output_filename: \"toymc_power_mu_{mu:.1f}.json\"
      toydata_filename: \"toydata_mu_{mu:.1f}.json\"";

fn write_configs(dir: &std::path::Path, in_common: &str) -> PathBuf {
    fs::write(dir.join("gaussian_model.yaml"), GAUSSIAN_MODEL).expect("failed to write model config");
    let config = dir.join("submitter.yaml");
    fs::write(&config, submitter_yaml(&dir.join("outputs"), in_common)).expect("failed to write submitter config");
    config
}

#[test]
fn variations_zip_then_vary() {
    let to_zip = object(json!({"a": [1, 2], "b": [3, 4]}));
    let to_vary = object(json!({"c": [5, 6]}));
    let in_common = object(json!({"d": 7}));
    let v = compute_variations(&to_zip, &to_vary, &in_common).expect("failed to compute variations");
    let expected = [(1, 3, 5), (1, 3, 6), (2, 4, 5), (2, 4, 6)];
    assert_eq!(v.len(), expected.len());
    for (m, (a, b, c)) in v.iter().zip(expected) {
        assert_eq!(m["a"], json!(a));
        assert_eq!(m["b"], json!(b));
        assert_eq!(m["c"], json!(c));
        assert_eq!(m["d"], json!(7));
    }

    let only_common = compute_variations(&Map::new(), &Map::new(), &in_common).unwrap();
    assert_eq!(only_common, vec![in_common.clone()]);
}

#[test]
fn variations_reject_ragged_or_duplicated_keys() {
    let ragged = object(json!({"a": [1, 2], "b": [3]}));
    let err = compute_variations(&ragged, &Map::new(), &Map::new()).expect_err("expected ragged zip error");
    assert!(err.to_string().contains("same length"));

    let dup = object(json!({"a": [1, 2]}));
    let err = compute_variations(&Map::new(), &dup, &object(json!({"a": 1}))).expect_err("expected duplicate key error");
    assert!(err.to_string().contains("more than one"));
}

#[test]
fn file_name_templates() {
    assert_eq!(add_i_batch("out.json").unwrap(), "out_{i_batch:d}.json");
    assert_eq!(add_i_batch("out").unwrap(), "out_{i_batch:d}");
    assert!(add_i_batch("out_{i_batch:d}.json").is_err());

    let vals: ParameterValues = [("mu".to_string(), 1.0), ("i_batch".to_string(), 3.0)].into_iter().collect();
    assert_eq!(
        format_template("toy_{mu:.2f}_{i_batch:d}.json", &vals).unwrap(),
        "toy_1.00_3.json"
    );
    assert_eq!(format_template("{{literal}}_{mu}", &vals).unwrap(), "{literal}_1");
    assert_eq!(format_template("{mu:.1e}", &vals).unwrap(), "1.0e0");
    let err = format_template("toy_{nu}.json", &vals).expect_err("expected missing key error");
    assert!(err.to_string().contains("nu"));
}

#[test]
fn n_batch_divides_n_mc() {
    let mut args = object(json!({"n_mc": 10, "n_batch": 2}));
    update_n_batch(&mut args).unwrap();
    assert_eq!(args["n_mc"], json!(5));

    let mut args = object(json!({"n_mc": 10, "n_batch": 3}));
    let err = update_n_batch(&mut args).expect_err("expected divisibility error");
    assert!(err.to_string().contains("divisible"));
}

#[test]
fn parameter_arguments_move_into_value_maps() {
    let fittable = vec!["mu".to_string(), "poi_expectation".to_string()];
    let fixed = vec!["sigma".to_string()];
    let mut args = object(json!({"mu": 1.0, "sigma": 2.0, "n_mc": 3, "generate_values": null}));
    update_runner_args(&mut args, &fittable, &fixed).unwrap();
    assert_eq!(args["generate_values"], json!({"mu": 1.0}));
    assert_eq!(args["nominal_values"], json!({"sigma": 2.0}));
    assert!(!args.contains_key("mu"));
    assert_eq!(args["n_mc"], json!(3));

    let mut args = object(json!({"mu": "high"}));
    let err = update_runner_args(&mut args, &fittable, &fixed).expect_err("expected numeric error");
    assert!(err.to_string().contains("must be numeric"));

    let mut args = object(json!({"generate_values": {"sigma": 1.0}}));
    let err = update_runner_args(&mut args, &fittable, &fixed).expect_err("expected subset error");
    assert!(err.to_string().contains("subset of the fittable"));
}

#[test]
fn command_line_values_round_trip() {
    let v = json!({"mu": 1.5});
    let s = arg_to_str(&v);
    assert_eq!(s, "{\"mu\":1.5}");
    assert_eq!(str_to_arg("generate_values", &s).unwrap(), v);
    assert_eq!(str_to_arg("poi", "mu").unwrap(), json!("mu"));
    assert_eq!(str_to_arg("n_mc", "10").unwrap(), json!(10));
    assert_eq!(str_to_arg("only_toydata", "true").unwrap(), json!(true));
    assert!(str_to_arg("bogus", "1").is_err());
    assert!(str_to_arg("n_mc", "ten").is_err());
}

#[test]
fn tickets_split_batches_and_format_names() {
    let dir = unique_temp_dir("alea_submit_tickets");
    let config_path = write_configs(&dir, IN_COMMON);
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    assert_eq!(submitter.config.computation, "discovery_power");
    assert_eq!(submitter.statistical_model_config, dir.join("gaussian_model.yaml"));

    let tickets = submitter.computation_tickets().expect("failed to build tickets");
    assert_eq!(tickets.len(), 4);
    let outputs = submitter.outputfolder.clone();
    let expected = [
        (0.0, 0, 10, "toymc_power_mu_0.0_0.json"),
        (0.0, 1, 11, "toymc_power_mu_0.0_1.json"),
        (1.0, 0, 10, "toymc_power_mu_1.0_0.json"),
        (1.0, 1, 11, "toymc_power_mu_1.0_1.json"),
    ];
    for (ticket, (mu, i_batch, seed, name)) in tickets.iter().zip(expected) {
        let config = &ticket.config;
        assert_eq!(config.n_mc, 2);
        assert_eq!(config.seed, Some(seed));
        assert_eq!(config.generate_values["mu"], mu);
        assert_eq!(config.nominal_values["sigma"], 1.0);
        assert_eq!(config.output_filename, Some(outputs.join(name)));
        assert_eq!(
            config.toydata_filename,
            Some(outputs.join(format!("toydata_mu_{mu:.1}_{i_batch}.json")))
        );
        assert!(ticket.script.starts_with("alea run-toymc --statistical_model GaussianModel --poi mu"));

        let parsed = runner_config_from_args(&ticket.args[1..]).expect("failed to parse ticket args");
        assert_eq!(&parsed, config);
    }

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn submitter_rejects_bad_arguments() {
    let dir = unique_temp_dir("alea_submit_bad");
    let config_path = write_configs(&dir, "      bogus: 1");
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    let err = submitter.computation_tickets().expect_err("expected unknown argument");
    assert!(err.to_string().contains("not all arguments are supported"));

    let config_path = write_configs(&dir, "      n_mc: 5\n      n_batch: 2");
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    assert!(submitter.computation_tickets().is_err());

    let config_path = write_configs(&dir, "      poi: nu");
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    let err = submitter.merged_arguments().expect_err("expected duplicated argument");
    assert!(err.to_string().contains("already specified in the submitter"));

    let mut config: SubmitterConfig = alea::io::config::load_yaml(&config_path).unwrap();
    config.computation = "threshold".to_string();
    let err = Submitter::new(config, Some(&config_path)).err().expect("expected missing computation");
    assert!(err.to_string().contains("is not in computation_options"));

    let mut config: SubmitterConfig = alea::io::config::load_yaml(&config_path).unwrap();
    config.statistical_model_config = PathBuf::from("missing.yaml");
    assert!(Submitter::new(config, Some(&config_path)).is_err());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn local_submission_runs_every_ticket() {
    let dir = unique_temp_dir("alea_submit_local");
    let config_path = write_configs(&dir, IN_COMMON);
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    LocalSubmitter { progress: false }
        .submit(&submitter)
        .expect("local submission failed");

    let mut outputs = Vec::new();
    for ticket in submitter.computation_tickets().unwrap() {
        let path = ticket.output_filename.expect("ticket has no output");
        outputs.push(read_output(&path).expect("failed to read runner output"));
    }
    assert_eq!(outputs.len(), 4);

    let rows = summarize(&outputs, "mu").expect("failed to summarize");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].generate_value, 0.0);
    assert_eq!(rows[1].generate_value, 1.0);
    for row in &rows {
        assert_eq!(row.n_toys, 4);
        assert!(row.upper_limit.is_none());
        let power = row.discovery_power_3sigma.expect("null table should give discovery power");
        assert!((0.0..=1.0).contains(&power));
    }

    let table = neyman_threshold(&outputs, "mu", 0.9).expect("failed to build threshold");
    assert_eq!(table.poi_values, vec![0.0, 1.0]);
    assert!(table.critical_values.iter().all(|v| *v >= 0.0));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn limit_threshold_moves_into_model_args() {
    let dir = unique_temp_dir("alea_submit_threshold");
    let in_common = format!("{IN_COMMON}\n      limit_threshold: \"threshold_{{mu:.1f}}.json\"");
    let config_path = write_configs(&dir, &in_common);
    let submitter = Submitter::from_config(&config_path).expect("failed to build submitter");
    let tickets = submitter.computation_tickets().expect("failed to build tickets");
    assert_eq!(tickets.len(), 4);
    for (ticket, mu) in tickets.iter().zip([0.0, 0.0, 1.0, 1.0]) {
        let expected = submitter.outputfolder.join(format!("threshold_{mu:.1}.json"));
        assert_eq!(ticket.config.statistical_model_args.limit_threshold, Some(expected));
        assert!(!ticket.args.iter().any(|a| a == "--limit_threshold"));
        let parsed = runner_config_from_args(&ticket.args[1..]).expect("failed to parse ticket args");
        assert_eq!(parsed, ticket.config);
    }

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn debug_submission_runs_only_the_first_ticket() {
    let dir = unique_temp_dir("alea_submit_debug");
    let config_path = write_configs(&dir, IN_COMMON);
    let mut config: SubmitterConfig = alea::io::config::load_yaml(&config_path).unwrap();
    config.debug = true;
    let submitter = Submitter::new(config, Some(&config_path)).expect("failed to build submitter");
    LocalSubmitter { progress: false }
        .submit(&submitter)
        .expect("debug submission failed");

    let outputs: Vec<PathBuf> = submitter
        .computation_tickets()
        .unwrap()
        .into_iter()
        .map(|t| t.output_filename.expect("ticket has no output"))
        .collect();
    assert_eq!(outputs.len(), 4);
    assert!(outputs[0].exists(), "first ticket should have run");
    assert!(outputs[1..].iter().all(|p| !p.exists()), "later tickets must not run in debug mode");

    let _ = fs::remove_dir_all(dir);
}
