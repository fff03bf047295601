//! Periodic task bodies.

#![allow(clippy::cast_precision_loss)]

use crate::fuel::{FuelInputs, ignition_advance};
use crate::io::{
    DigitalInput, DigitalOutput, EngineIo, Level, PwmChannel, TelemetryChannel, TelemetrySink,
};
use crate::scheduler::Completion;
use crate::sequencer::power_reset;
use crate::status::StatusFlags;
use crate::telemetry::BusMessage;
use crate::trigger::{TriggerSettings, rpm_from_period};

use super::Runtime;

/// Sensors, map lookup, AFR trim, pulse width and advance.
pub(crate) fn high_frequency<IO: EngineIo>(rt: &mut Runtime<'_, IO>, done: &mut Completion) {
    let timestamp = rt.io.now_ms() as f32 * 0.001;
    let page = rt.config.page();

    if rt.shared.in_sync() > 0 {
        rt.rpm = rpm_from_period(rt.shared.filtered_period_us(), page.p2.tw_teeth.max(2));
    }

    match rt.io.read_filtered() {
        Ok(frame) => rt.frame = frame,
        Err(_) => rt.status.set(StatusFlags::ADC_TIMEOUT),
    }
    let frame = rt.frame;

    rt.lookup.lookup(rt.rpm, frame.map_kpa);
    let cell = rt.lookup.current_cell();

    let active = rt.afr.compute_correction(
        &page.target_afr_map,
        &page.p1,
        rt.rpm,
        frame.coolant_c,
        cell,
        frame.lambda_mv,
    );
    rt.status.assign(StatusFlags::AFR_ACTIVE, active);

    let inputs = FuelInputs {
        rpm: rt.rpm,
        load: frame.map_kpa,
        tps_percent: frame.tps_percent,
        engine_temp: frame.coolant_c,
        air_temp: frame.air_c,
    };
    let pulse_width = rt
        .fuel
        .injector_pulse_width(page, &rt.lookup, rt.afr.correction(), &inputs);
    let advance = ignition_advance(&rt.lookup, &page.ignition_map);
    rt.shared.publish(pulse_width, advance, rt.rpm);

    let snapshot = &mut rt.snapshot;
    snapshot.timestamp = timestamp;
    snapshot.map_kpa = frame.map_kpa;
    snapshot.lambda_mv = frame.lambda_mv;
    snapshot.coolant_c = frame.coolant_c;
    snapshot.air_c = frame.air_c;
    snapshot.tps_mv = frame.tps_mv;
    snapshot.battery_v = frame.battery_v;
    snapshot.tps_percent = frame.tps_percent;
    snapshot.rpm = rt.rpm;
    snapshot.injector_pw_us = pulse_width;
    snapshot.interpolated_ve = rt.fuel.interpolated_ve();
    snapshot.temp_comp = rt.fuel.temp_comp();
    snapshot.accel_comp = rt.fuel.accel_comp();
    snapshot.current_cell = cell.flat() as f32;
    snapshot.error_tooth = rt.shared.error_tooth() as f32;
    snapshot.sync_errors = rt.shared.sync_errors() as f32;
    snapshot.advance = advance;

    done.mark_done();
}

/// Idle switch, idle actuator, VVT and the bus RPM frame.
pub(crate) fn low_frequency<IO: EngineIo>(rt: &mut Runtime<'_, IO>, done: &mut Completion) {
    let switch_on = rt.io.read_digital(DigitalInput::IdleSwitch) == Level::Low;
    rt.status.assign(StatusFlags::IDLE_SWITCH_ON, switch_on);

    let page = rt.config.page();
    let frame = rt.frame;
    let target_tps = rt.idle.target_tps(&page.p1, rt.rpm, frame.coolant_c);
    if let Some(duty) = rt
        .idle
        .actuate(&page.p1, frame.tps_percent, target_tps, switch_on)
    {
        rt.io.set_duty_cycle(PwmChannel::IdleActuator, duty);
    }

    let vvt_duty = rt.vvt.duty(rt.rpm);
    rt.io.set_duty_cycle(PwmChannel::Vvt, vvt_duty);

    rt.snapshot.target_tps = target_tps;
    rt.snapshot.idle_actuator = rt.idle.demand();
    rt.snapshot.vvt_duty = vvt_duty;
    rt.snapshot.thermistor_ohms = frame.thermistor_ohms;

    send(&mut rt.io, BusMessage::rpm(rt.rpm));
    done.mark_done();
}

/// Stationary crank detection, cooling fan, AFR save request, bus frames
/// and the heartbeat.
pub(crate) fn very_low_frequency<IO: EngineIo>(rt: &mut Runtime<'_, IO>, done: &mut Completion) {
    let page = rt.config.page();

    if rt.shared.in_sync() == rt.last_in_sync {
        rt.shared.clear_sync();
        rt.rpm = 0.0;
        let settings = TriggerSettings::from_page(page, rt.layout);
        power_reset(&mut rt.io, settings.coil_on.inverted());
    }
    rt.last_in_sync = rt.shared.in_sync();

    let fan_on = rt.frame.coolant_c > page.p1.cooling_fan_on_temp;
    rt.io
        .set_duty_cycle(PwmChannel::CoolingFan, if fan_on { 100.0 } else { 0.0 });
    rt.status.assign(StatusFlags::COOLING_FAN_ON, fan_on);

    rt.save_afr_pending = true;

    send(
        &mut rt.io,
        BusMessage::ThrottleSwitch(rt.status.contains(StatusFlags::IDLE_SWITCH_ON)),
    );
    send(&mut rt.io, rt.snapshot.bus_sensors());
    send(&mut rt.io, rt.snapshot.bus_injection());

    rt.heartbeat = rt.heartbeat.inverted();
    rt.io.set_digital(DigitalOutput::StatusLed, rt.heartbeat);

    done.mark_done();
}

fn send<S: TelemetrySink + ?Sized>(sink: &mut S, message: BusMessage) {
    sink.transmit(TelemetryChannel::Bus(message.id()), &message.payload());
}
