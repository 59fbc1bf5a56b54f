use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::Result;
use hackrf_ctrl::StreamControl;

fn main() -> Result<()> {
    // Open up a file for buffered writing.
    let mut args = std::env::args();
    args.next();
    let file_name = args.next().unwrap_or_else(|| String::from("./rx.bin"));
    let mut file = BufWriter::new(File::create(&file_name)?);

    // Open up the HackRF
    let hackrf = hackrf_ctrl::open_hackrf()?;

    // Configure: 20MHz sample rate, turn on the RF amp, set IF & BB gains to 16 dB,
    // and tune to 915 MHz.
    hackrf.set_amp_enable(true)?;
    hackrf.set_sample_rate(20e6)?;
    hackrf.set_lna_gain(16)?;
    hackrf.set_vga_gain(16)?;
    hackrf.set_freq(915_000_000)?;

    // Write every block to the file straight from the stream worker. The
    // writer is dropped, and with it flushed, once the stream is stopped.
    hackrf.start_rx(move |block| {
        if file.write_all(block).is_err() {
            return StreamControl::Stop;
        }
        StreamControl::Continue
    })?;

    println!("Recording to {file_name}. Press Enter to stop.");
    std::io::stdin().read_line(&mut String::new())?;

    hackrf.stop_rx()?;
    Ok(())
}
