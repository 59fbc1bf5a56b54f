use std::sync::mpsc;

use anyhow::Result;
use hackrf_ctrl::{SWEEP_BLOCK_LEN, StreamControl, SweepBlock, SweepParams};

fn main() -> Result<()> {
    // Open up the HackRF
    let hackrf = hackrf_ctrl::open_hackrf()?;

    // Configure: IF & BB gains to 16 dB. The sweep itself sets the sample
    // rate.
    hackrf.set_lna_gain(16)?;
    hackrf.set_vga_gain(16)?;

    // Sweep the 2.4 GHz ISM band at 20 MHz per tuning.
    let mut params = SweepParams::for_sample_rate(20_000_000);
    params.freq_mhz = vec![(2400, 2480)];

    // Measure average power per tuning block on the stream worker, and ship
    // the numbers over for printing.
    let (measure_tx, measure_rx) = mpsc::channel();
    hackrf.start_rx_sweep(&params, move |buf| {
        for chunk in buf.chunks_exact(SWEEP_BLOCK_LEN) {
            let Ok(block) = SweepBlock::parse(chunk) else {
                continue;
            };
            let mut pow_sum = 0.0f64;
            for x in block.samples() {
                let re = x.re as f64;
                let im = x.im as f64;
                pow_sum += re * re + im * im;
            }
            let power =
                (pow_sum / (block.samples().len() as f64 * 127.0 * 127.0)).log10() * 10.;
            if measure_tx.send((block.freq_hz(), power)).is_err() {
                return StreamControl::Stop;
            }
        }
        StreamControl::Continue
    })?;

    // Print the first 200 tunings, then stop.
    for _ in 0..200 {
        let (freq_hz, power) = measure_rx.recv()?;
        println!("{freq_hz:>13} Hz: {power:.1} dbFS");
    }
    hackrf.stop_rx()?;
    Ok(())
}
