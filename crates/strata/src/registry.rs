// StageRegistry — Factory from kind strings to stage implementations
//
// Kinds map to constructor closures taking the stage's config block. The
// default registry knows every built-in kind; `register` adds or replaces
// kinds. Constructors are `Send + Sync` so one registry can be shared by
// every worker thread.

use std::collections::HashMap;
use std::fmt;

use strata_core::{Error, Format, Result};
use strata_nn::{
    AddTo, BatchNorm, Concat, Pointwise, ReLU, ReorderStage, Reshape, Scale, StageOps, Tanh,
    WeightFormat,
};

use crate::config::StageConfig;

pub type StageFactory = Box<dyn Fn(&StageConfig) -> Result<Box<dyn StageOps>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    /// A registry with no kinds.
    pub fn empty() -> Self {
        StageRegistry {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in kind.
    pub fn new() -> Self {
        let mut r = Self::empty();
        r.register("relu", |_| boxed(ReLU::new()));
        r.register("tanh", |_| boxed(Tanh::new()));
        r.register("addto", |_| boxed(AddTo::new()));
        r.register("concat", |_| boxed(Concat::new()));
        r.register("scale", |cfg| boxed(Scale::new(cfg.usize_attr("channels")?)?));
        r.register("pointwise", |cfg| {
            let policy = weight_format(cfg)?;
            boxed(Pointwise::new(
                cfg.usize_attr("in_channels")?,
                cfg.usize_attr("out_channels")?,
                policy,
                cfg.opt_u64_attr("seed")?,
            )?)
        });
        r.register("batch_norm", |cfg| {
            let mut bn = BatchNorm::new(cfg.usize_attr("channels")?)?;
            if let Some(eps) = cfg.opt_f32_attr("eps")? {
                bn = bn.with_eps(eps);
            }
            if let Some(maf) = cfg.opt_f32_attr("moving_average_fraction")? {
                bn = bn.with_moving_average_fraction(maf);
            }
            bn = bn.with_use_global_stats(cfg.opt_bool_attr("use_global_stats")?);
            boxed(bn)
        });
        r.register("reorder", |cfg| {
            let target: Format = cfg
                .opt_str_attr("format")?
                .ok_or_else(|| Error::config(format!("stage '{}': reorder needs 'format'", cfg.name)))?
                .parse()?;
            let block = cfg.opt_u64_attr("block")?.map(|b| b as usize);
            boxed(ReorderStage::new(target, block)?)
        });
        r.register("reshape", |cfg| boxed(Reshape::new(cfg.dims_attr("dims")?)?));
        r
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&StageConfig) -> Result<Box<dyn StageOps>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn create(&self, cfg: &StageConfig) -> Result<Box<dyn StageOps>> {
        let factory = self
            .factories
            .get(&cfg.kind)
            .ok_or_else(|| Error::UnknownStageKind(cfg.kind.clone()))?;
        factory(cfg)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn boxed(ops: impl StageOps + 'static) -> Result<Box<dyn StageOps>> {
    Ok(Box::new(ops))
}

fn weight_format(cfg: &StageConfig) -> Result<WeightFormat> {
    match cfg.opt_str_attr("weight_format")? {
        None | Some("external") => Ok(WeightFormat::External),
        Some("internal") => Ok(WeightFormat::Internal),
        Some(other) => Err(Error::config(format!(
            "stage '{}': unknown weight_format '{other}'",
            cfg.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let r = StageRegistry::new();
        assert_eq!(
            r.kinds(),
            vec![
                "addto",
                "batch_norm",
                "concat",
                "pointwise",
                "relu",
                "reorder",
                "reshape",
                "scale",
                "tanh"
            ]
        );
    }

    #[test]
    fn test_unknown_kind() {
        let r = StageRegistry::new();
        let cfg = StageConfig::new("c", "conv3d", &["x"]);
        assert!(matches!(r.create(&cfg), Err(Error::UnknownStageKind(k)) if k == "conv3d"));
    }

    #[test]
    fn test_reorder_attrs_parsed() {
        let r = StageRegistry::new();
        let cfg = StageConfig::new("r", "reorder", &["x"])
            .with_attr("format", "nchwc")
            .with_attr("block", 8);
        assert_eq!(r.create(&cfg).unwrap().kind(), "reorder");
        let bad = StageConfig::new("r", "reorder", &["x"]).with_attr("format", "zyx");
        assert!(matches!(r.create(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_reshape_dims_parsed() {
        let r = StageRegistry::new();
        let cfg = StageConfig::new("v", "reshape", &["x"]).with_attr("dims", vec![4, -1, 2]);
        assert_eq!(r.create(&cfg).unwrap().kind(), "reshape");
        let missing = StageConfig::new("v", "reshape", &["x"]);
        assert!(matches!(r.create(&missing), Err(Error::Config(_))));
        let bad = StageConfig::new("v", "reshape", &["x"]).with_attr("dims", vec![-2]);
        assert!(matches!(r.create(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_register_custom_kind() {
        let mut r = StageRegistry::empty();
        assert!(!r.contains("relu"));
        r.register("my_relu", |_| boxed(ReLU::new()));
        let cfg = StageConfig::new("m", "my_relu", &["x"]);
        assert_eq!(r.create(&cfg).unwrap().kind(), "relu");
    }
}
