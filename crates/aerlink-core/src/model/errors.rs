// ── Service fault-code table ──
//
// Devices report faults as a numeric `error_code` datapoint; the vendor
// remote shows these as a letter code plus description. Table as shipped
// in the vendor's heat-pump firmware documentation.

/// Remote-display code and description for a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub code: &'static str,
    pub description: &'static str,
}

const FAULTS: &[(i64, FaultInfo)] = &[
    (0, FaultInfo { code: "H00", description: "No abnormality detected" }),
    (2, FaultInfo { code: "H91", description: "Tank booster heater OLP abnormality" }),
    (13, FaultInfo { code: "F38", description: "Unknown" }),
    (20, FaultInfo { code: "H90", description: "Indoor / outdoor abnormal communication" }),
    (36, FaultInfo { code: "H99", description: "Indoor heat exchanger freeze prevention" }),
    (38, FaultInfo { code: "H72", description: "Tank temperature sensor abnormality" }),
    (42, FaultInfo { code: "H12", description: "Indoor / outdoor capacity unmatched" }),
    (156, FaultInfo { code: "H76", description: "Indoor - control panel communication abnormality" }),
    (193, FaultInfo { code: "F12", description: "Pressure switch activate" }),
    (195, FaultInfo { code: "F14", description: "Outdoor compressor abnormal rotation" }),
    (196, FaultInfo { code: "F15", description: "Outdoor fan motor lock abnormality" }),
    (197, FaultInfo { code: "F16", description: "Total running current protection" }),
    (200, FaultInfo { code: "F20", description: "Outdoor compressor overheating protection" }),
    (202, FaultInfo { code: "F22", description: "IPM overheating protection" }),
    (203, FaultInfo { code: "F23", description: "Outdoor DC peak detection" }),
    (204, FaultInfo { code: "F24", description: "Refrigerant cycle abnormality" }),
    (205, FaultInfo { code: "F27", description: "Pressure switch abnormality" }),
    (207, FaultInfo { code: "F46", description: "Outdoor current transformer open circuit" }),
    (208, FaultInfo { code: "F36", description: "Outdoor air temperature sensor abnormality" }),
    (209, FaultInfo { code: "F37", description: "Indoor water inlet temperature sensor abnormality" }),
    (210, FaultInfo { code: "F45", description: "Indoor water outlet temperature sensor abnormality" }),
    (212, FaultInfo { code: "F40", description: "Outdoor discharge pipe temperature sensor abnormality" }),
    (214, FaultInfo { code: "F41", description: "PFC control" }),
    (215, FaultInfo { code: "F42", description: "Outdoor heat exchanger temperature sensor abnormality" }),
    (216, FaultInfo { code: "F43", description: "Outdoor defrost temperature sensor abnormality" }),
    (222, FaultInfo { code: "H95", description: "Indoor / outdoor wrong connection" }),
    (224, FaultInfo { code: "H15", description: "Outdoor compressor temperature sensor abnormality" }),
    (225, FaultInfo { code: "H23", description: "Indoor refrigerant liquid temperature sensor abnormality" }),
    (226, FaultInfo { code: "H24", description: "Unknown" }),
    (227, FaultInfo { code: "H38", description: "Indoor / outdoor mismatch" }),
    (228, FaultInfo { code: "H61", description: "Unknown" }),
    (229, FaultInfo { code: "H62", description: "Water flow switch abnormality" }),
    (230, FaultInfo { code: "H63", description: "Refrigerant low pressure abnormality" }),
    (231, FaultInfo { code: "H64", description: "Refrigerant high pressure abnormality" }),
    (232, FaultInfo { code: "H42", description: "Compressor low pressure abnormality" }),
    (233, FaultInfo { code: "H98", description: "Outdoor high pressure overload protection" }),
    (234, FaultInfo { code: "F25", description: "Cooling / heating cycle changeover abnormality" }),
    (235, FaultInfo { code: "F95", description: "Cooling high pressure overload protection" }),
    (236, FaultInfo { code: "H70", description: "Indoor backup heater OLP abnormality" }),
    (237, FaultInfo { code: "F48", description: "Outdoor EVA outlet temperature sensor abnormality" }),
    (238, FaultInfo { code: "F49", description: "Outdoor bypass outlet temperature sensor abnormality" }),
    (65535, FaultInfo { code: "N/A", description: "Communication error between adapter and unit" }),
];

/// Look up the fault behind a reported `error_code` value.
pub fn fault_info(error_code: i64) -> Option<FaultInfo> {
    FAULTS
        .iter()
        .find(|(code, _)| *code == error_code)
        .map(|(_, info)| *info)
}
