//! # Poll scheduler
//!
//! The poll loop is a future the application spawns; it selects between the
//! control queue and a 100 ms deadline re-armed after each pass. Every tick
//! reads the device status and runs the change-of-state trackers; every
//! tenth tick additionally reads watt-hours and instant energy and feeds the
//! accumulators. When the EMTR is parked in the boot loader the tick shrinks
//! to a state query that keeps its watchdog quiet.

use core::sync::atomic::Ordering;

use embassy_futures::select::{select, Either};
use embassy_time::{Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, ReadReady, Write};

use crate::cmd::cmd_device::{InstantRsp, KwhRsp, StatusRsp};
use crate::event::{Event, EventSink};
use crate::link::CmdOptions;
use crate::status::{DevFlags, RunMode};
use crate::{EmtrError, Emtr, Inner, TxSelectPin};

/// Poll cadence
pub(crate) const POLL_PERIOD_MS: u64 = 100;

/// Ticks between energy reads
pub(crate) const POLL_CYCLES_PER_SEC: u32 = 10;

/// Control messages consumed by the poll loop
#[derive(Debug, Clone, Copy)]
pub(crate) enum Msg {
    Pause,
    Resume,
    Stop,
}

impl<U, R, S> Emtr<U, R, S>
where
    U: Read + ReadReady + Write,
    R: OutputPin,
    S: TxSelectPin,
{
    /// Drive the poll scheduler
    ///
    /// Spawn this once from a dedicated task after [`init`](Self::init).
    /// Returns when [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        loop {
            match select(self.queue.receive(), Timer::after_millis(POLL_PERIOD_MS)).await {
                Either::First(Msg::Stop) => return,
                Either::First(Msg::Pause) => {
                    self.inner.lock().await.pause = true;
                }
                Either::First(Msg::Resume) => {
                    let mut inner = self.inner.lock().await;
                    inner.pause = false;
                    inner.poll_sample_ct = 0;
                }
                Either::Second(()) => {
                    if !self.running.load(Ordering::Relaxed)
                        || self.timer_stopped.load(Ordering::Relaxed)
                    {
                        continue;
                    }

                    let evt = self.sink();
                    let mut inner = self.inner.lock().await;
                    inner.handle_tick(&evt, Instant::now()).await;

                    // A factory-reset request from the EMTR stops the poll
                    // timer and is surfaced exactly once
                    let fr_mask = inner.conf.dev_flag.factory_reset;
                    if DevFlags(inner.device.flags).contains(fr_mask)
                        && !self.timer_stopped.swap(true, Ordering::Relaxed)
                    {
                        evt.notify(Event::FactoryReset);
                    }
                }
            }
        }
    }
}

impl<U, R, S> Inner<U, R, S>
where
    U: Read + ReadReady + Write,
    R: OutputPin,
    S: TxSelectPin,
{
    /// One pass of the poll loop
    pub(crate) async fn handle_tick(&mut self, evt: &EventSink<'_>, now: Instant) {
        match self.run_mode {
            RunMode::BootLoader => {
                // Keep the boot loader watchdog quiet; the reported mode
                // is not acted upon
                let _ = self.run_mode_query(evt).await;
            }
            RunMode::Application => {
                if self.read_device_state(evt).await.is_err() {
                    return;
                }

                self.apply_change_of_state(evt, now.as_secs() as u32);

                // Nothing below produces data updates while paused
                if self.pause {
                    return;
                }

                // Energy is sampled once per second
                self.poll_sample_ct += 1;
                if self.poll_sample_ct < POLL_CYCLES_PER_SEC {
                    return;
                }
                self.poll_sample_ct = 0;

                let _ = self.read_energy(evt, now.as_millis()).await;
            }
            RunMode::NotRunning => {}
        }
    }

    /// Read the device status report and stash the per-socket flag bytes
    async fn read_device_state(&mut self, evt: &EventSink<'_>) -> Result<(), EmtrError> {
        let num = self.conf.sockets.len();
        let mut rsp = StatusRsp::new(num);
        let opt = CmdOptions::default();
        let len = self
            .do_command(evt, self.conf.cmd.status_get, None, Some(rsp.as_mut()), &opt)
            .await?;
        if len < rsp.min_len() {
            return Err(EmtrError::BadFrame);
        }
        rsp.set_len(len);

        for wire_idx in 0..num {
            let sock_num = self.conf.wire_order.sock_num(num as u8, wire_idx);
            if let Some(sock) = self.sock_mut(sock_num) {
                sock.last_flags = rsp.sock_flags(wire_idx);
            }
        }

        self.device.temperature = rsp.temperature();
        self.device.uptime = rsp.uptime();
        self.device.flags = rsp.dev_flags().0;
        Ok(())
    }

    /// Run every tracker against the flags captured by the last status read
    fn apply_change_of_state(&mut self, evt: &EventSink<'_>, now_s: u32) {
        let masks = self.conf.sock_flag;

        for sock in self.sockets.iter_mut() {
            let sock_num = sock.info.sock_num;
            let flags = sock.last_flags;

            if let Some(active) = sock.relay_active.observe(flags.contains(masks.relay_active)) {
                sock.status.relay_active = active;
                sock.cos_time_relay = now_s;
                // The EMTR samples power characteristics right after a
                // relay transition; give it room before the next command
                self.hold_off_command = true;
                evt.notify(Event::RelayState { sock_num, active });
            }

            if let Some(present) = sock.plug_detect.observe(flags.contains(masks.plug_detect)) {
                sock.status.plug_detected = present;
                evt.notify(Event::PlugState { sock_num, present });
            }

            if let Some(active) = sock.load_active.observe(flags.contains(masks.load_active)) {
                sock.status.load_active = active;
                sock.cos_time_load = now_s;
                evt.notify(Event::LoadState { sock_num, active });
            }

            if let Some(active) = sock.overload.observe(flags.contains(masks.overload)) {
                sock.status.overload = active;
                evt.notify(Event::Overload { sock_num, active });
            }
        }
    }

    /// Read watt-hours and instant energy, then feed the accumulators
    async fn read_energy(&mut self, evt: &EventSink<'_>, now_ms: u64) -> Result<(), EmtrError> {
        let num = self.conf.sockets.len();
        let order = self.conf.wire_order;
        let opt = CmdOptions::default();

        let mut kwh = KwhRsp::new();
        let len = self
            .do_command(evt, self.conf.cmd.kwh_get, None, Some(kwh.as_mut()), &opt)
            .await?;
        if len != KwhRsp::len_for(num) {
            return Err(EmtrError::BadFrame);
        }

        for wire_idx in 0..num {
            let sock_num = order.sock_num(num as u8, wire_idx);
            if let Some(sock) = self.sock_mut(sock_num) {
                sock.status.d_watt_hours = u64::from(kwh.watt_hours(wire_idx));
            }
        }

        let mut inst = InstantRsp::new();
        let len = self
            .do_command(evt, self.conf.cmd.instant_get, None, Some(inst.as_mut()), &opt)
            .await?;
        if len != InstantRsp::len_for(num) {
            return Err(EmtrError::BadFrame);
        }

        for wire_idx in 0..num {
            let sock_num = order.sock_num(num as u8, wire_idx);
            let Some(sock) = self.sock_mut(sock_num) else { continue };

            let mut energy = inst.energy(wire_idx);

            // Without an active load the power factor reading is noise;
            // pin it to 100 before anything downstream sees it
            let load_active = sock.load_active.is_true();
            if !load_active {
                energy.p_factor = 100;
            }
            sock.status.inst_energy = energy;

            for (chan, acc) in sock.acc.iter_mut().enumerate() {
                // The load channel only accumulates while a load is active
                if chan == 0 && !load_active {
                    continue;
                }
                acc.update(now_ms, &energy);
            }
        }

        Ok(())
    }
}
