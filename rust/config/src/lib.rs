//! Experiment configuration types shared between smplfit crates.

mod experiment;
mod types;

pub use experiment::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_params_default() {
        let params = ExperimentParams::default();
        assert_eq!(params.exper_name, "debug");
        assert_eq!(params.n_epoches, 100);
        assert_eq!(params.batch_size, 4);
        assert_eq!(params.shader, Shader::SoftSilhouetteShader);
        assert!(params.debug);
    }

    #[test_case("debug", None, 1 ; "debug_experiment")]
    #[test_case("smpl_fit", None, 50 ; "named_experiment")]
    #[test_case("debug_v2", None, 50 ; "prefix_is_not_debug")]
    #[test_case("smpl_fit", Some(10), 10 ; "explicit_wins")]
    #[test_case("debug", Some(5), 5 ; "explicit_wins_for_debug")]
    fn test_display_step(name: &str, explicit: Option<usize>, expected: usize) {
        let params = ExperimentParams {
            exper_name: name.into(),
            n_display_step: explicit,
            ..Default::default()
        };
        assert_eq!(params.display_step(), expected);
    }

    #[test]
    fn test_cli_args_exact() {
        let params = ExperimentParams::default();
        assert_eq!(
            params.to_cli_args(),
            vec![
                "--exper_name",
                "debug",
                "--n_epoches",
                "100",
                "--batch_size",
                "4",
                "--n_display_step",
                "1",
                "--smpl_registration_path",
                DEFAULT_REGISTRATION_PATH,
                "--shader",
                "soft_silhouette_shader",
                "--debug",
            ]
        );
    }

    #[test]
    fn test_cli_args_optional_flags() {
        let params = ExperimentParams {
            exper_name: "fit".into(),
            debug: false,
            seed: Some(71),
            device: Some(Device::Cpu),
            n_workers: Some(0),
            load_checkpoints_path: Some("checkpoints/fit/model_final.pth".into()),
            extra_args: vec!["--use_cuda_benchmark".into()],
            ..Default::default()
        };
        let args = params.to_cli_args();
        assert!(!args.contains(&"--debug".to_string()));
        assert_eq!(
            &args[12..],
            &[
                "--seed",
                "71",
                "--device",
                "cpu",
                "--n_workers",
                "0",
                "--load_checkpoints_path",
                "checkpoints/fit/model_final.pth",
                "--use_cuda_benchmark",
            ]
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("  " ; "blank")]
    #[test_case(".." ; "parent")]
    #[test_case("." ; "current")]
    #[test_case("a/b" ; "nested")]
    #[test_case("../etc" ; "escape")]
    fn test_rejects_unsafe_names(name: &str) {
        let params = ExperimentParams {
            exper_name: name.into(),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_counts() {
        let params = ExperimentParams {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(ParamsError::Zero("batch_size")));

        let params = ExperimentParams {
            n_epoches: 0,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(ParamsError::Zero("n_epoches")));
    }

    #[test]
    fn test_overrides_apply() {
        let mut params = ExperimentParams::default();
        ParamOverrides {
            exper_name: Some("fit_f".into()),
            epochs: Some(20),
            no_debug: true,
            ..Default::default()
        }
        .apply(&mut params);
        assert_eq!(params.exper_name, "fit_f");
        assert_eq!(params.n_epoches, 20);
        assert_eq!(params.batch_size, 4);
        assert!(!params.debug);
        assert_eq!(params.display_step(), DEFAULT_DISPLAY_STEP);
    }

    #[test]
    fn test_enum_serde() {
        assert_eq!(
            serde_json::from_str::<Shader>("\"soft_phong_shader\"").unwrap(),
            Shader::SoftPhongShader
        );
        assert_eq!(
            serde_json::from_str::<Device>("\"cpu\"").unwrap(),
            Device::Cpu
        );
        assert_eq!(
            serde_json::from_str::<LaunchMode>("\"test\"").unwrap(),
            LaunchMode::Test
        );
    }

    #[test]
    fn test_shader_display_matches_serde() {
        for shader in [
            Shader::SoftSilhouetteShader,
            Shader::SoftPhongShader,
            Shader::TexturedSoftPhongShader,
        ] {
            assert_eq!(
                serde_json::to_string(&shader).unwrap(),
                format!("\"{shader}\"")
            );
        }
        assert!(serde_json::from_str::<Shader>("\"phong\"").is_err());
    }

    #[test]
    fn test_params_from_toml_partial() {
        let params: ExperimentParams = toml::from_str(
            r#"
exper_name = "fit_m"
batch_size = 8
shader = "soft_phong_shader"
"#,
        )
        .unwrap();
        assert_eq!(params.exper_name, "fit_m");
        assert_eq!(params.batch_size, 8);
        assert_eq!(params.n_epoches, 100);
        assert_eq!(params.shader, Shader::SoftPhongShader);
        assert!(params.debug);
    }
}
