use std::time::Duration;

use growbot_common::{DeviceModel, FirmwareVersion};

/// Static metadata for one measurement field a model can report. `tag` is the
/// option-list token the device uses; models without an option list carry a
/// single field with an empty tag.
pub struct FieldSpec {
    pub tag: &'static str,
    pub quantity: &'static str,
    pub unit: &'static str,
    pub minimum: f64,
    pub maximum: f64,
}

/// Accepted calibration arguments for a model. Validation happens against
/// this before anything touches the bus.
pub struct CalibrationSpec {
    /// Named points that take a numeric value (`Cal,<point>,<value>`).
    pub valued_points: &'static [&'static str],
    /// Named points sent without a value (`Cal,<point>`).
    pub bare_points: &'static [&'static str],
    /// Whether a bare numeric value is accepted (`Cal,<value>`).
    pub accepts_value: bool,
}

impl CalibrationSpec {
    pub const NONE: Self = Self {
        valued_points: &[],
        bare_points: &[],
        accepts_value: false,
    };

    const VALUE_ONLY: Self = Self {
        valued_points: &[],
        bare_points: &[],
        accepts_value: true,
    };

    pub fn supported(&self) -> bool {
        self.accepts_value || !self.valued_points.is_empty() || !self.bare_points.is_empty()
    }
}

pub struct ModelProfile {
    pub model: DeviceModel,
    /// Settle delay between the read command and response availability.
    pub settle: Duration,
    /// Device moment for short generic commands.
    pub moment: Duration,
    pub fields: &'static [FieldSpec],
    /// Option-list tokens the model understands; empty when the model has no
    /// option list and measure decodes the single fixed field.
    pub option_tags: &'static [&'static str],
    pub calibration: CalibrationSpec,
    /// Firmware floors for gated features; None means never available.
    pub find_since: Option<FirmwareVersion>,
    pub export_since: Option<FirmwareVersion>,
    pub plock_since: Option<FirmwareVersion>,
    pub is_pump: bool,
}

const FIND_SINCE: Option<FirmwareVersion> = Some(FirmwareVersion::new(2, 10, 0));
const EXPORT_SINCE: Option<FirmwareVersion> = Some(FirmwareVersion::new(2, 10, 0));
const PLOCK_SINCE: Option<FirmwareVersion> = Some(FirmwareVersion::new(1, 95, 0));

/// Unit-dependent full-scale range of the pressure module. Selecting a unit
/// changes the declared maximum that measure reports.
pub const PRESSURE_UNITS: &[(&str, f64)] = &[
    ("psi", 50.0),
    ("atm", 3.402),
    ("bar", 3.447),
    ("kPa", 344.738),
    ("inh2o", 1383.7),
    ("cmh2o", 3515.1),
];

pub fn pressure_maximum(unit: &str) -> Option<f64> {
    PRESSURE_UNITS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(unit))
        .map(|(_, max)| *max)
}

static RTD: ModelProfile = ModelProfile {
    model: DeviceModel::Rtd,
    settle: Duration::from_millis(600),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "temperature",
        unit: "°C",
        minimum: -126.0,
        maximum: 1254.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: EXPORT_SINCE,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static PH: ModelProfile = ModelProfile {
    model: DeviceModel::Ph,
    settle: Duration::from_millis(900),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "ph",
        unit: "pH",
        minimum: 0.001,
        maximum: 14.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec {
        valued_points: &["low", "mid", "high"],
        bare_points: &[],
        accepts_value: false,
    },
    find_since: FIND_SINCE,
    export_since: EXPORT_SINCE,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static EC: ModelProfile = ModelProfile {
    model: DeviceModel::Ec,
    settle: Duration::from_millis(600),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "EC",
            quantity: "conductivity",
            unit: "μS/cm",
            minimum: 0.07,
            maximum: 500_000.0,
        },
        FieldSpec {
            tag: "TDS",
            quantity: "total_dissolved_solids",
            unit: "PPM",
            minimum: 0.04,
            maximum: 250_000.0,
        },
        FieldSpec {
            tag: "S",
            quantity: "salinity",
            unit: "PSU",
            minimum: 0.0,
            maximum: 42.0,
        },
        FieldSpec {
            tag: "SG",
            quantity: "specific_gravity",
            unit: "",
            minimum: 1.0,
            maximum: 1.3,
        },
    ],
    option_tags: &["EC", "TDS", "S", "SG"],
    calibration: CalibrationSpec {
        valued_points: &["low", "high"],
        bare_points: &["dry"],
        accepts_value: true,
    },
    find_since: FIND_SINCE,
    export_since: EXPORT_SINCE,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static ORP: ModelProfile = ModelProfile {
    model: DeviceModel::Orp,
    settle: Duration::from_millis(900),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "oxidation_reduction_potential",
        unit: "mV",
        minimum: -1019.9,
        maximum: 1019.9,
    }],
    option_tags: &[],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: EXPORT_SINCE,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static DO: ModelProfile = ModelProfile {
    model: DeviceModel::Do,
    settle: Duration::from_millis(600),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "MG",
            quantity: "dissolved_oxygen",
            unit: "mg/L",
            minimum: 0.01,
            maximum: 100.0,
        },
        FieldSpec {
            tag: "%",
            quantity: "saturation",
            unit: "%",
            minimum: 0.1,
            maximum: 400.0,
        },
    ],
    option_tags: &["MG", "%"],
    calibration: CalibrationSpec {
        valued_points: &[],
        bare_points: &["atmospheric", "zero"],
        accepts_value: false,
    },
    find_since: FIND_SINCE,
    export_since: EXPORT_SINCE,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static PMP: ModelProfile = ModelProfile {
    model: DeviceModel::Pmp,
    settle: Duration::from_millis(300),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "dispensed_volume",
        unit: "mL",
        minimum: 0.0,
        maximum: 105.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: true,
};

static PMPL: ModelProfile = ModelProfile {
    model: DeviceModel::Pmpl,
    settle: Duration::from_millis(300),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "dispensed_volume",
        unit: "mL",
        minimum: 0.0,
        maximum: 1000.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: true,
};

static CO2: ModelProfile = ModelProfile {
    model: DeviceModel::Co2,
    settle: Duration::from_millis(900),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "PPM",
            quantity: "carbon_dioxide",
            unit: "ppm",
            minimum: 0.0,
            maximum: 10_000.0,
        },
        FieldSpec {
            tag: "T",
            quantity: "internal_temperature",
            unit: "°C",
            minimum: -20.0,
            maximum: 50.0,
        },
    ],
    option_tags: &["PPM", "T"],
    calibration: CalibrationSpec::NONE,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static O2: ModelProfile = ModelProfile {
    model: DeviceModel::O2,
    settle: Duration::from_millis(900),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "oxygen",
        unit: "ppt",
        minimum: 0.01,
        maximum: 420.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec {
        valued_points: &[],
        bare_points: &["atmospheric"],
        accepts_value: false,
    },
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static HUM: ModelProfile = ModelProfile {
    model: DeviceModel::Hum,
    settle: Duration::from_millis(300),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "HUM",
            quantity: "humidity",
            unit: "%",
            minimum: 0.0,
            maximum: 100.0,
        },
        FieldSpec {
            tag: "T",
            quantity: "air_temperature",
            unit: "°C",
            minimum: -20.0,
            maximum: 50.0,
        },
        FieldSpec {
            tag: "DEW",
            quantity: "dew_point",
            unit: "°C",
            minimum: -20.0,
            maximum: 50.0,
        },
    ],
    option_tags: &["HUM", "T", "DEW"],
    calibration: CalibrationSpec::NONE,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static PRS: ModelProfile = ModelProfile {
    model: DeviceModel::Prs,
    settle: Duration::from_millis(900),
    moment: Duration::from_millis(300),
    fields: &[FieldSpec {
        tag: "",
        quantity: "pressure",
        unit: "psi",
        minimum: 0.0,
        maximum: 50.0,
    }],
    option_tags: &[],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static FLOW: ModelProfile = ModelProfile {
    model: DeviceModel::Flow,
    settle: Duration::from_millis(300),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "TV",
            quantity: "total_volume",
            unit: "L",
            minimum: 0.0,
            maximum: 10_000.0,
        },
        FieldSpec {
            tag: "FR",
            quantity: "flow_rate",
            unit: "L/min",
            minimum: 0.0,
            maximum: 100.0,
        },
    ],
    option_tags: &["TV", "FR"],
    calibration: CalibrationSpec::VALUE_ONLY,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

static RGB: ModelProfile = ModelProfile {
    model: DeviceModel::Rgb,
    settle: Duration::from_millis(1300),
    moment: Duration::from_millis(300),
    fields: &[
        FieldSpec {
            tag: "R",
            quantity: "red",
            unit: "",
            minimum: 0.0,
            maximum: 255.0,
        },
        FieldSpec {
            tag: "G",
            quantity: "green",
            unit: "",
            minimum: 0.0,
            maximum: 255.0,
        },
        FieldSpec {
            tag: "B",
            quantity: "blue",
            unit: "",
            minimum: 0.0,
            maximum: 255.0,
        },
        FieldSpec {
            tag: "LUX",
            quantity: "illuminance",
            unit: "lux",
            minimum: 0.0,
            maximum: 65_535.0,
        },
    ],
    option_tags: &["R", "G", "B", "LUX"],
    calibration: CalibrationSpec::NONE,
    find_since: FIND_SINCE,
    export_since: None,
    plock_since: PLOCK_SINCE,
    is_pump: false,
};

/// Static registry mapping the closed model set to its profile. Models not
/// listed here are not probe modules.
pub fn profile_for(model: DeviceModel) -> Option<&'static ModelProfile> {
    match model {
        DeviceModel::Rtd => Some(&RTD),
        DeviceModel::Ph => Some(&PH),
        DeviceModel::Ec => Some(&EC),
        DeviceModel::Orp => Some(&ORP),
        DeviceModel::Do => Some(&DO),
        DeviceModel::Pmp => Some(&PMP),
        DeviceModel::Pmpl => Some(&PMPL),
        DeviceModel::Co2 => Some(&CO2),
        DeviceModel::O2 => Some(&O2),
        DeviceModel::Hum => Some(&HUM),
        DeviceModel::Prs => Some(&PRS),
        DeviceModel::Flow => Some(&FLOW),
        DeviceModel::Rgb => Some(&RGB),
        DeviceModel::Bme280
        | DeviceModel::Bmp280
        | DeviceModel::Cpu
        | DeviceModel::Camera => None,
    }
}

pub fn field_for_tag(profile: &'static ModelProfile, tag: &str) -> Option<&'static FieldSpec> {
    profile
        .fields
        .iter()
        .find(|field| field.tag.eq_ignore_ascii_case(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_probe_model_has_a_profile() {
        for model in [
            DeviceModel::Rtd,
            DeviceModel::Ph,
            DeviceModel::Ec,
            DeviceModel::Orp,
            DeviceModel::Do,
            DeviceModel::Pmp,
            DeviceModel::Pmpl,
            DeviceModel::Co2,
            DeviceModel::O2,
            DeviceModel::Hum,
            DeviceModel::Prs,
            DeviceModel::Flow,
            DeviceModel::Rgb,
        ] {
            let profile = profile_for(model).expect("missing profile");
            assert_eq!(profile.model, model);
            assert!(!profile.fields.is_empty());
        }
    }

    #[test]
    fn option_tags_all_resolve_to_fields() {
        for model in [DeviceModel::Ec, DeviceModel::Do, DeviceModel::Hum] {
            let profile = profile_for(model).unwrap();
            for tag in profile.option_tags {
                assert!(field_for_tag(profile, tag).is_some(), "{model} tag {tag}");
            }
        }
    }

    #[test]
    fn pressure_unit_table_changes_declared_maximum() {
        assert_eq!(pressure_maximum("psi"), Some(50.0));
        assert_eq!(pressure_maximum("kPa"), Some(344.738));
        assert_eq!(pressure_maximum("furlongs"), None);
    }

    #[test]
    fn non_probe_models_have_no_profile() {
        assert!(profile_for(DeviceModel::Bme280).is_none());
        assert!(profile_for(DeviceModel::Cpu).is_none());
        assert!(profile_for(DeviceModel::Camera).is_none());
    }
}
