use super::reading::Reading;
use serde_json::Value;

/// Home Assistant entity platform used for every field.
pub const PLATFORM: &str = "sensor";

/// Discovery metadata for a field that is exposed as an entity.
#[derive(Debug)]
pub struct Component {
    pub key: &'static str,
    pub name: &'static str,
    pub device_class: &'static str,
    pub unit: Option<&'static str>,
    pub precision: u8,
}

/// One leaf of the state payload: `{group: {member: value}}`.
pub struct PayloadField {
    pub group: &'static str,
    pub member: &'static str,
    pub value: fn(&Reading) -> Value,
    /// `None` for raw values that are published but not advertised.
    pub component: Option<Component>,
}

impl PayloadField {
    /// Dotted path as used in `value_json.<path>` templates.
    pub fn value_path(&self) -> String {
        format!("{}.{}", self.group, self.member)
    }
}

/// Payload layout in wire order. The `celcius` spelling is part of the
/// published format and must not be corrected.
pub static PAYLOAD_FIELDS: [PayloadField; 8] = [
    PayloadField {
        group: "temperature",
        member: "celcius",
        value: celsius_display,
        component: Some(Component {
            key: "temperature_celcius",
            name: "Temperature °C",
            device_class: "temperature",
            unit: Some("°C"),
            precision: 2,
        }),
    },
    PayloadField {
        group: "temperature",
        member: "fahrenheit",
        value: fahrenheit_display,
        component: Some(Component {
            key: "temperature_fahrenheit",
            name: "Temperature °F",
            device_class: "temperature",
            unit: Some("°F"),
            precision: 2,
        }),
    },
    PayloadField {
        group: "temperature",
        member: "raw",
        value: celsius_raw,
        component: None,
    },
    PayloadField {
        group: "pressure",
        member: "pressure",
        value: pressure_display,
        component: Some(Component {
            key: "pressure",
            name: "Pressure",
            device_class: "pressure",
            unit: Some("hPa"),
            precision: 1,
        }),
    },
    PayloadField {
        group: "pressure",
        member: "raw",
        value: pressure_raw,
        component: None,
    },
    PayloadField {
        group: "humidity",
        member: "humidity",
        value: humidity_display,
        component: Some(Component {
            key: "humidity",
            name: "Humidity",
            device_class: "humidity",
            unit: Some("%"),
            precision: 2,
        }),
    },
    PayloadField {
        group: "humidity",
        member: "raw",
        value: humidity_raw,
        component: None,
    },
    PayloadField {
        group: "airQuality",
        member: "resistance",
        value: gas_resistance,
        component: Some(Component {
            key: "air_quality",
            name: "Air Quality",
            device_class: "aqi",
            unit: None,
            precision: 0,
        }),
    },
];

/// Fields that are advertised through discovery, in component order.
pub fn advertised() -> impl Iterator<Item = (&'static PayloadField, &'static Component)> {
    PAYLOAD_FIELDS
        .iter()
        .filter_map(|field| field.component.as_ref().map(|component| (field, component)))
}

fn celsius_display(r: &Reading) -> Value {
    fixed(r.temperature_celsius, 2)
}

fn fahrenheit_display(r: &Reading) -> Value {
    fixed(r.temperature_fahrenheit, 2)
}

fn celsius_raw(r: &Reading) -> Value {
    Value::from(r.temperature_celsius)
}

fn pressure_display(r: &Reading) -> Value {
    fixed(r.pressure_hpa, 3)
}

fn pressure_raw(r: &Reading) -> Value {
    Value::from(r.pressure_hpa)
}

fn humidity_display(r: &Reading) -> Value {
    fixed(r.humidity_percent, 2)
}

fn humidity_raw(r: &Reading) -> Value {
    Value::from(r.humidity_percent)
}

fn gas_resistance(r: &Reading) -> Value {
    Value::from(r.gas_resistance_ohms)
}

/// Fixed-precision decimal string. Rounds the exact binary value, so the
/// output is deterministic for a given `f64`.
fn fixed(value: f64, decimals: usize) -> Value {
    Value::String(format!("{:.*}", decimals, value))
}
