use serde::Serialize;

use crate::search::AddressFunction;

/// Outcome of one reverse engineering run, serialized as JSON by the binary.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    /// RFC 3339 timestamp of the run
    date: String,
    /// Whether the masks explain the bank count
    success: bool,
    banks: usize,
    block_size: usize,
    threshold: u64,
    seed: u64,
    /// Addresses of the additional blocks that matched no bank
    classification_errors: usize,
    masks: Vec<String>,
    /// Dominant parity of every bank, one row per mask
    parities: Vec<Vec<u64>>,
    orthogonal: bool,
    relevant_bits: String,
    /// Free form data of the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl AnalysisReport {
    /// Summarizes `function` together with the classifier state it came from.
    pub fn new(
        function: &AddressFunction,
        block_size: usize,
        threshold: u64,
        seed: u64,
        classification_errors: usize,
    ) -> Self {
        AnalysisReport {
            date: chrono::Local::now().to_rfc3339(),
            success: function.is_complete(),
            banks: function.bank_count(),
            block_size,
            threshold,
            seed,
            classification_errors,
            masks: function.masks().iter().map(|m| format!("0x{:x}", m)).collect(),
            parities: function.parities().to_vec(),
            orthogonal: function.is_orthogonal(),
            relevant_bits: format!("0x{:x}", function.relevant_bits()),
            data: None,
        }
    }

    /// Attaches additional metadata.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether the run found a complete address function.
    pub fn success(&self) -> bool {
        self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::search::FunctionSearch;

    #[test]
    fn test_json_layout() -> anyhow::Result<()> {
        let groups = vec![vec![0x0000, 0x4000], vec![0x2000, 0x6000]];
        let config = AnalysisConfig {
            max_mask_bits: 1,
            threads: 1,
            ..Default::default()
        };
        let function = FunctionSearch::new(&groups, 0x2000, &config).calculate_bit_masks(1)?;
        let report = AnalysisReport::new(&function, 0x2000, 250, 7, 3)
            .with_data(serde_json::json!({ "allocator": "thp" }));
        assert!(report.success());
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["masks"], serde_json::json!(["0x2000"]));
        assert_eq!(json["parities"], serde_json::json!([[0, 1]]));
        assert_eq!(json["banks"], 2);
        assert_eq!(json["classification_errors"], 3);
        assert_eq!(json["data"]["allocator"], "thp");
        assert!(json["date"].is_string());
        Ok(())
    }
}
