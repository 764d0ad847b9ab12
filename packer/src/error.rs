use thiserror::Error;

///Errors raised while post-processing a file. The first two kinds abort the
///run; the region kinds are downgraded to warnings by the pipeline and only
///skip the affected overhang region.
#[derive(Error, Debug)]
pub enum PostError {
    #[error("required slicer setting `{key}` is missing from the g-code config block")]
    SettingMissing { key: String },

    #[error("slicer setting `{key}` = `{value}` could not be parsed")]
    SettingUnreadable { key: String, value: String },

    #[error("incompatible slicer settings: {reason}")]
    SettingIncompatible { reason: String },

    #[error("could not read input file: {0}")]
    Io(#[from] std::io::Error),

    #[error("layer {layer}: no previous-layer perimeter touches the overhang region")]
    NoPrevLayerSupport { layer: usize },

    #[error("layer {layer}: no concentric seed family could be generated on the start line")]
    NoSeedFamily { layer: usize },

    #[error("layer {layer}: unexpected geometry while {context}")]
    GeometryDegenerate { layer: usize, context: String },
}

impl PostError {
    ///Region-level failures skip one overhang region, everything else ends the run.
    pub fn is_region_failure(&self) -> bool {
        matches!(
            self,
            PostError::NoPrevLayerSupport { .. }
                | PostError::NoSeedFamily { .. }
                | PostError::GeometryDegenerate { .. }
        )
    }
}
