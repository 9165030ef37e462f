//! Widget registry.
//!
//! Each widget kind declares a name and a predicate over the instrument's
//! [`FeatureFlags`]. A UI layer builds the widgets returned by
//! [`enabled_widgets`] for the active instrument.

use serde::{Deserialize, Serialize};

/// Optional widgets supported by an instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Second plot of the core variables.
    pub spectrum_plot: bool,
    /// Table of formatted auxiliary values.
    pub aux_data: bool,
    /// Tree of per-frame metadata.
    pub metadata: bool,
    /// Channel picker for the timeseries plot.
    pub select_channel: bool,
    /// Filter/total switch control.
    pub flow_control: bool,
    /// Pump schedule control.
    pub pump_control: bool,
}

/// Registry entry of one widget kind.
#[derive(Debug, Clone, Copy)]
pub struct WidgetSpec {
    /// Widget name.
    pub name: &'static str,
    /// Whether the widget is shown for an instrument.
    pub enabled: fn(&FeatureFlags) -> bool,
}

/// Every widget kind, in display order.
pub const WIDGETS: &[WidgetSpec] = &[
    WidgetSpec {
        name: "select_channel",
        enabled: |f| f.select_channel,
    },
    WidgetSpec {
        name: "spectrum_plot",
        enabled: |f| f.spectrum_plot,
    },
    WidgetSpec {
        name: "aux_data",
        enabled: |f| f.aux_data,
    },
    WidgetSpec {
        name: "metadata",
        enabled: |f| f.metadata,
    },
    WidgetSpec {
        name: "flow_control",
        enabled: |f| f.flow_control,
    },
    WidgetSpec {
        name: "pump_control",
        enabled: |f| f.pump_control,
    },
];

/// Names of the widgets enabled by `flags`.
pub fn enabled_widgets(flags: &FeatureFlags) -> Vec<&'static str> {
    WIDGETS
        .iter()
        .filter(|w| (w.enabled)(flags))
        .map(|w| w.name)
        .collect()
}
