use std::fmt;

/// Stable identifier of a parameter group in the store and the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamName {
    Means3D,
    RgbColors,
    UnnormRotations,
    LogitOpacities,
    LogScales,
    CamUnnormRots,
    CamTrans,
}

impl ParamName {
    pub const ALL: [Self; 7] = [
        Self::Means3D,
        Self::RgbColors,
        Self::UnnormRotations,
        Self::LogitOpacities,
        Self::LogScales,
        Self::CamUnnormRots,
        Self::CamTrans,
    ];

    /// Groups whose leading dimension is the point count.
    pub const POINTS: [Self; 5] = [
        Self::Means3D,
        Self::RgbColors,
        Self::UnnormRotations,
        Self::LogitOpacities,
        Self::LogScales,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Means3D => "means3D",
            Self::RgbColors => "rgb_colors",
            Self::UnnormRotations => "unnorm_rotations",
            Self::LogitOpacities => "logit_opacities",
            Self::LogScales => "log_scales",
            Self::CamUnnormRots => "cam_unnorm_rots",
            Self::CamTrans => "cam_trans",
        }
    }

    /// Camera pose groups are indexed by frame, not by point, and are never
    /// touched by operations that change the point count.
    pub fn is_point_indexed(self) -> bool {
        !matches!(self, Self::CamUnnormRots | Self::CamTrans)
    }

    /// Row width of the group's rank-2 tensor.
    pub fn width(self) -> usize {
        match self {
            Self::Means3D | Self::RgbColors | Self::LogScales | Self::CamTrans => 3,
            Self::UnnormRotations | Self::CamUnnormRots => 4,
            Self::LogitOpacities => 1,
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
