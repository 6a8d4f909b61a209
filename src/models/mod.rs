pub mod binned;
pub mod gaussian;

use anyhow::{Result, anyhow, bail};
use std::path::PathBuf;

use crate::model::StatisticalModel;
use crate::parameters::{ParameterDefinition, ParameterValues};

pub use binned::BinnedExtendedModel;
pub use gaussian::GaussianModel;

/// Everything needed to construct a registered model.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub parameter_definition: Option<ParameterDefinition>,
    pub likelihood_config: Option<serde_json::Value>,
    pub nominal_values: ParameterValues,
    pub template_path: Option<PathBuf>,
}

/// Accepts short names and dotted/`::` paths; only the last segment matters.
pub fn model_short_name(name: &str) -> &str {
    name.rsplit(['.', ':']).next().unwrap_or(name)
}

pub fn build_model(name: &str, spec: &ModelSpec) -> Result<Box<dyn StatisticalModel>> {
    let mut model: Box<dyn StatisticalModel> = match model_short_name(name) {
        "GaussianModel" => Box::new(GaussianModel::new(spec.parameter_definition.as_ref())?),
        "BinnedExtendedModel" => {
            let definition = spec
                .parameter_definition
                .as_ref()
                .ok_or_else(|| anyhow!("BinnedExtendedModel needs a parameter_definition"))?;
            let likelihood_config = spec
                .likelihood_config
                .as_ref()
                .ok_or_else(|| anyhow!("BinnedExtendedModel needs a likelihood_config"))?;
            Box::new(BinnedExtendedModel::new(
                definition,
                likelihood_config,
                spec.template_path.as_deref(),
            )?)
        }
        other => bail!(
            "unknown statistical model {other:?}, available: GaussianModel, BinnedExtendedModel"
        ),
    };
    model.parameters_mut().set_nominal_values(&spec.nominal_values)?;
    Ok(model)
}
