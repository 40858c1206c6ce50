use indicatif::ProgressStyle;

/// Progress bar styles with a fixed-width label in front of the bar.
pub trait NamedProgress {
    /// Bar style labelled with `name`, padded so that stacked bars line up.
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let template = format!(
            "{:<28} {{wide_bar:40.green/white}} {{pos:>5}}/{{len:<5}} [{{elapsed_precise}}] {{msg}}",
            name
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}
