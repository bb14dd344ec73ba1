//! Prometheus gauges for battery telemetry and the `/metrics` HTTP endpoint.

use anyhow::Result;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use jbdbms_lib::poller::EventSink;
use jbdbms_lib::protocol::{BasicInfo, CellVoltages, Event, HardwareInfo};
use log::{debug, error};
use once_cell::sync::Lazy;
use prometheus::{register_gauge_vec, Encoder, GaugeVec, TextEncoder};
use std::convert::Infallible;

const LABELS: &[&str] = &["name", "mac"];
const INDEXED_LABELS: &[&str] = &["name", "mac", "index"];

macro_rules! battery_gauge {
    ($name:literal, $help:literal, $labels:expr) => {
        Lazy::new(|| {
            register_gauge_vec!($name, $help, $labels)
                .expect(concat!("Failed to register ", $name, " metric"))
        })
    };
}

pub static BATTERY_VOLTAGE: Lazy<GaugeVec> =
    battery_gauge!("battery_voltage_volts", "Battery pack voltage", LABELS);
pub static BATTERY_CURRENT: Lazy<GaugeVec> = battery_gauge!(
    "battery_current_amperes",
    "Battery current (positive = discharge)",
    LABELS
);
pub static BATTERY_REMAINING_CAPACITY: Lazy<GaugeVec> = battery_gauge!(
    "battery_remaining_capacity_ampere_hours",
    "Remaining battery capacity",
    LABELS
);
pub static BATTERY_NOMINAL_CAPACITY: Lazy<GaugeVec> = battery_gauge!(
    "battery_nominal_capacity_ampere_hours",
    "Nominal battery capacity",
    LABELS
);
pub static BATTERY_CYCLES: Lazy<GaugeVec> = battery_gauge!(
    "battery_cycles_total",
    "Battery charge/discharge cycles",
    LABELS
);
pub static BATTERY_SOC: Lazy<GaugeVec> = battery_gauge!(
    "battery_state_of_charge_percent",
    "Battery state of charge",
    LABELS
);
pub static BATTERY_CELLS: Lazy<GaugeVec> =
    battery_gauge!("battery_cells_total", "Number of cells in battery", LABELS);
pub static BATTERY_NTC_TEMPERATURE: Lazy<GaugeVec> = battery_gauge!(
    "battery_ntc_temperature_celsius",
    "NTC temperature sensors",
    INDEXED_LABELS
);
pub static BATTERY_CELL_VOLTAGE: Lazy<GaugeVec> = battery_gauge!(
    "battery_cell_voltage_volts",
    "Individual cell voltages",
    INDEXED_LABELS
);

pub fn publish_basic_info(hw: &HardwareInfo, info: &BasicInfo) {
    let labels = [hw.name.as_str(), hw.device_id.as_str()];

    BATTERY_VOLTAGE
        .with_label_values(&labels)
        .set(f64::from(info.battery_voltage_v));
    BATTERY_CURRENT
        .with_label_values(&labels)
        .set(f64::from(info.current_a));
    BATTERY_REMAINING_CAPACITY
        .with_label_values(&labels)
        .set(f64::from(info.remaining_capacity_ah));
    BATTERY_NOMINAL_CAPACITY
        .with_label_values(&labels)
        .set(f64::from(info.nominal_capacity_ah));
    BATTERY_CYCLES
        .with_label_values(&labels)
        .set(f64::from(info.cycle_count));
    BATTERY_SOC
        .with_label_values(&labels)
        .set(f64::from(info.state_of_charge_pct));
    BATTERY_CELLS
        .with_label_values(&labels)
        .set(f64::from(info.cell_count));

    for (i, temp) in info.ntc_temps_c.iter().enumerate() {
        let index = i.to_string();
        BATTERY_NTC_TEMPERATURE
            .with_label_values(&[labels[0], labels[1], index.as_str()])
            .set(f64::from(*temp));
    }
}

pub fn publish_cell_voltages(hw: &HardwareInfo, cells: &CellVoltages) {
    for (i, v) in cells.cell_voltages_v.iter().enumerate() {
        let index = i.to_string();
        BATTERY_CELL_VOLTAGE
            .with_label_values(&[hw.name.as_str(), hw.device_id.as_str(), index.as_str()])
            .set(f64::from(*v));
    }
}

/// Labels one device's telemetry with the identity it reported first.
#[derive(Debug, Default)]
pub struct MetricsSink {
    hardware_info: Option<HardwareInfo>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for MetricsSink {
    fn on_event(&mut self, device_id: &str, event: Event) {
        match event {
            Event::HardwareInfo(hw) => {
                debug!("Publishing metrics for '{device_id}' as '{}'", hw.name);
                self.hardware_info = Some(hw);
            }
            telemetry => match (&self.hardware_info, telemetry) {
                (Some(hw), Event::BasicInfo(info)) => publish_basic_info(hw, &info),
                (Some(hw), Event::CellVoltages(cells)) => publish_cell_voltages(hw, &cells),
                (Some(_), Event::HardwareInfo(_)) => {}
                (None, telemetry) => {
                    error!("Telemetry from '{device_id}' arrived before its hardware info: {telemetry:?}");
                }
            },
        }
    }
}

/// Get metrics in Prometheus text format
pub fn get_metrics_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

async fn serve_metrics(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut response = Response::new(Body::from("Not Found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    }

    match get_metrics_text() {
        Ok(text) => {
            let mut response = Response::new(Body::from(text));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            Ok(response)
        }
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            let mut response = Response::new(Body::from(e.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

/// Serve `/metrics` on an already bound listener until the runtime shuts down.
pub async fn serve(server: hyper::server::Builder<AddrIncoming>) {
    let service =
        make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(serve_metrics)) });
    if let Err(e) = server.serve(service).await {
        error!("Metrics server error: {e}");
    }
}

/// Bind the metrics listener; must be called inside a Tokio runtime.
pub fn bind(addr: &std::net::SocketAddr) -> Result<hyper::server::Builder<AddrIncoming>> {
    Ok(Server::try_bind(addr)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware_info(name: &str) -> HardwareInfo {
        HardwareInfo {
            device_id: "A4:C1:37:00:11:22".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn sink_labels_telemetry_with_hardware_info() {
        let mut sink = MetricsSink::new();
        sink.on_event("A4:C1:37:00:11:22", Event::HardwareInfo(hardware_info("sink-test")));
        sink.on_event(
            "A4:C1:37:00:11:22",
            Event::BasicInfo(BasicInfo {
                battery_voltage_v: 12.54,
                current_a: -0.5,
                remaining_capacity_ah: 42.0,
                nominal_capacity_ah: 50.0,
                cycle_count: 12,
                state_of_charge_pct: 87,
                cell_count: 4,
                ntc_temps_c: vec![26.0, 24.5],
            }),
        );
        sink.on_event(
            "A4:C1:37:00:11:22",
            Event::CellVoltages(CellVoltages {
                cell_voltages_v: vec![3.3, 3.298],
            }),
        );

        let labels = ["sink-test", "A4:C1:37:00:11:22"];
        assert_eq!(
            BATTERY_VOLTAGE.with_label_values(&labels).get(),
            f64::from(12.54f32)
        );
        assert_eq!(BATTERY_CURRENT.with_label_values(&labels).get(), -0.5);
        assert_eq!(BATTERY_SOC.with_label_values(&labels).get(), 87.0);
        assert_eq!(
            BATTERY_NTC_TEMPERATURE
                .with_label_values(&["sink-test", "A4:C1:37:00:11:22", "1"])
                .get(),
            24.5
        );
        assert_eq!(
            BATTERY_CELL_VOLTAGE
                .with_label_values(&["sink-test", "A4:C1:37:00:11:22", "1"])
                .get(),
            f64::from(3.298f32)
        );

        let text = get_metrics_text().unwrap();
        assert!(text.contains("battery_cycles_total"));
        assert!(text.contains("name=\"sink-test\""));
    }

    #[test]
    fn sink_ignores_telemetry_without_identity() {
        let mut sink = MetricsSink::new();
        sink.on_event(
            "A4:C1:37:00:11:22",
            Event::CellVoltages(CellVoltages {
                cell_voltages_v: vec![3.3],
            }),
        );
        assert!(sink.hardware_info.is_none());
    }
}
