use anyhow::Result;
use vx_core::{
    clone_version, create_version, delete_version, realize_version, run_handler, run_ui,
    validate_version, CloneRequest, Config, CreateRequest, DeleteRequest, ExecutionOutcome,
    RealizeRequest, RunHandlerRequest, RunUiRequest, ValidateRequest,
};

use crate::cli::{CommandCli, VxCli};

pub fn dispatch_command(config: &Config, cli: &VxCli) -> Result<ExecutionOutcome> {
    match &cli.command {
        CommandCli::Create(args) => {
            let request = CreateRequest {
                version_id: args.version_id.clone(),
                engine: args.engine.clone(),
                extensions: args.extensions.clone(),
                models: args.models.clone(),
                extensions_file: args.extensions_file.clone(),
                models_file: args.models_file.clone(),
                models_root: args.models_root.clone(),
                auto_checksum: args.auto_checksum,
                output: args.output.clone(),
                force: args.force,
            };
            create_version(config, &request)
        }
        CommandCli::Validate(args) => validate_version(
            config,
            &ValidateRequest {
                version_id: args.version_id.clone(),
            },
        ),
        CommandCli::Realize(args) => {
            let request = RealizeRequest {
                version_id: args.version_id.clone(),
                target: args.target.clone(),
                models_dir: args.models_dir.clone(),
                wheels_dir: args.wheels_dir.clone(),
                dry_run: args.dry_run,
                overwrite: args.overwrite,
            };
            realize_version(config, &request)
        }
        CommandCli::RunUi(args) => {
            let request = RunUiRequest {
                version_id: args.version_id.clone(),
                host: args.host.clone(),
                port: args.port,
                target: args.target.clone(),
                models_dir: args.models_dir.clone(),
                wheels_dir: args.wheels_dir.clone(),
                extra_args: args.extra_args.clone(),
            };
            run_ui(config, &request)
        }
        CommandCli::RunHandler(args) => {
            let request = RunHandlerRequest {
                version_id: args.version_id.clone(),
                workflow_file: args.workflow.clone(),
                output_mode: args.output.map(|mode| mode.as_str().to_string()),
                out_file: args.out_file.clone(),
                object_bucket: args.object_bucket.clone(),
                object_prefix: args.object_prefix.clone(),
                models_dir: args.models_dir.clone(),
                input_images: parse_input_pairs(&args.inputs)?,
                verbose: cli.verbose > 0,
            };
            run_handler(config, &request)
        }
        CommandCli::Clone(args) => clone_version(
            config,
            &CloneRequest {
                source_version: args.source_version.clone(),
                new_version: args.new_version.clone(),
                output: args.output.clone(),
                force: args.force,
            },
        ),
        CommandCli::Delete(args) => delete_version(
            config,
            &DeleteRequest {
                version_id: args.version_id.clone(),
                target: args.target.clone(),
                remove_spec: args.remove_spec,
                remove_model_symlinks: args.remove_model_symlinks,
                force: args.force,
            },
        ),
    }
}

fn parse_input_pairs(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, url)| (name.to_string(), url.to_string()))
                .ok_or_else(|| {
                    vx_core::core_error(
                        vx_core::ErrorKind::Usage,
                        format!("--input expects NAME=URL, got '{pair}'"),
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_pairs_split_on_first_equals() {
        let pairs = parse_input_pairs(&[
            "img.png=https://host/a.png?sig=x=y".to_string(),
        ])
        .expect("parse");
        assert_eq!(
            pairs,
            vec![(
                "img.png".to_string(),
                "https://host/a.png?sig=x=y".to_string()
            )]
        );
        assert!(parse_input_pairs(&["no-equals".to_string()]).is_err());
    }
}
