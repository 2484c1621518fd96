use candle_core::{Device, Tensor};
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

const RECORDS: usize = 12;
const STEPS: usize = 3;
const FEATURES: usize = 2;

fn write_npy_pair(dir: &Path, features_name: &str, labels_name: &str, id_offset: usize) {
    let features: Vec<f32> = (0..RECORDS * STEPS * FEATURES)
        .map(|v| ((v * 7) % 13) as f32 / 13.0 - 0.5)
        .collect();
    Tensor::from_vec(features, (RECORDS, STEPS, FEATURES), &Device::Cpu)
        .expect("feature tensor")
        .write_npy(dir.join(features_name))
        .expect("write features");

    let mut labels = Vec::with_capacity(RECORDS * 7);
    for i in 0..RECORDS {
        let positive = (i % 2) as f64;
        labels.extend_from_slice(&[
            (id_offset + i) as f64,
            positive,
            1.0 - positive,
            2.5,
            4.0,
            positive,
            1.0 - positive,
        ]);
    }
    Tensor::from_vec(labels, (RECORDS, 7), &Device::Cpu)
        .expect("label tensor")
        .write_npy(dir.join(labels_name))
        .expect("write labels");
}

fn run(exe: &str, cwd: &Path, args: &[&str]) {
    let output = Command::new(exe)
        .current_dir(cwd)
        .args(args)
        .output()
        .expect("run clinfair cli");
    assert!(
        output.status.success(),
        "clinfair {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn train_test_and_audit_end_to_end() {
    let tmp = tempdir().expect("temporary directory");
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(&data_dir).expect("data dir");
    write_npy_pair(&data_dir, "data_X_train_new.npy", "data_y_train_new.npy", 100);
    write_npy_pair(&data_dir, "data_X_final_test.npy", "data_y_final_test.npy", 500);

    let exe = env!("CARGO_BIN_EXE_clinfair");
    let data = data_dir.to_str().expect("path str");
    let model_args = [
        "--device",
        "cpu",
        "--input-size",
        "2",
        "--hidden-size",
        "3",
        "--num-layers",
        "1",
        "--batch-size",
        "4",
    ];

    let mut train_args = vec!["train", "--data-dir", data, "--output-dir", "out", "--epochs", "2", "--folds", "2"];
    train_args.extend_from_slice(&model_args);
    run(exe, tmp.path(), &train_args);

    let exp = tmp.path().join("out/train/exp0");
    assert!(exp.join("config.toml").exists(), "config.toml missing");
    for fold in 0..2 {
        let fold_dir = exp.join(format!("fold{fold}"));
        assert!(fold_dir.join("best.safetensors").exists(), "checkpoint missing");
        assert!(fold_dir.join("model.toml").exists(), "model.toml missing");
        assert!(fold_dir.join("val_acc.tsv").exists(), "val_acc.tsv missing");
        assert!(fold_dir.join("roc_curve_icu.tsv").exists(), "roc curve missing");
        let history = fs::read_to_string(fold_dir.join("val_acc.tsv")).expect("read history");
        assert_eq!(history.lines().count(), 3);
    }

    let weight = exp.join("fold0/best.safetensors");
    run(
        exe,
        tmp.path(),
        &[
            "test",
            "--weight",
            weight.to_str().expect("path str"),
            "--data-dir",
            data,
            "--output-dir",
            "out",
            "--device",
            "cpu",
            "--batch-size",
            "5",
            "--save-results",
        ],
    );
    let test_exp = tmp.path().join("out/test/exp0");
    let result = test_exp.join("result.csv");
    let table = fs::read_to_string(&result).expect("read result.csv");
    let mut lines = table.lines();
    assert_eq!(
        lines.next(),
        Some("stay_id,label_hosp_gt,label_icu_gt,die_24_gt,alive_24_gt,label_hosp,label_icu,die_24,alive_24")
    );
    assert_eq!(lines.count(), RECORDS);
    assert!(test_exp.join("metrics.tsv").exists());

    let mut baseline = String::from("stay_id,race,gender,insurance,admission_type\n");
    for i in 0..RECORDS {
        baseline.push_str(&format!("{},{},{},{},{}\n", 500 + i, 1 + i % 8, i % 2, 1 + i % 6, 1 + i % 9));
    }
    let baseline_path = tmp.path().join("baseline.csv");
    fs::write(&baseline_path, baseline).expect("write baseline");

    run(
        exe,
        tmp.path(),
        &[
            "fairness",
            "--predictions",
            result.to_str().expect("path str"),
            "--baseline",
            baseline_path.to_str().expect("path str"),
        ],
    );
    for attribute in ["race", "gender", "insurance", "admission_type"] {
        assert!(
            test_exp.join("fairness").join(attribute).join("metrics.tsv").exists(),
            "fairness report for {attribute} missing"
        );
    }
}

#[test]
fn unknown_codes_exit_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let predictions = tmp.path().join("result.csv");
    fs::write(
        &predictions,
        "stay_id,label_hosp_gt,label_icu_gt,die_24_gt,alive_24_gt,label_hosp,label_icu,die_24,alive_24\n\
         1,1,0,0,1,0.9,0.1,0.2,0.8\n",
    )
    .expect("write predictions");
    let baseline = tmp.path().join("baseline.csv");
    fs::write(&baseline, "stay_id,race,gender,insurance,admission_type\n1,42,1,1,1\n")
        .expect("write baseline");

    let output = Command::new(env!("CARGO_BIN_EXE_clinfair"))
        .current_dir(tmp.path())
        .args([
            "fairness",
            "--predictions",
            predictions.to_str().expect("path str"),
            "--baseline",
            baseline.to_str().expect("path str"),
            "--attribute",
            "race",
        ])
        .output()
        .expect("run clinfair cli");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
    assert!(stderr.contains("42"), "stderr: {stderr}");
}
