use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use anyhow::Result;
use hackrf_ctrl::StreamControl;

fn main() -> Result<()> {
    // Open up a file for buffered reading.
    let mut args = std::env::args();
    args.next();
    let file_name = args.next().unwrap_or_else(|| String::from("./tx.bin"));
    let file = BufReader::new(File::open(&file_name)?);

    // Open up the HackRF
    let hackrf = hackrf_ctrl::open_hackrf()?;

    // Configure: 20MHz sample rate, turn on RF amp, set TX IF gain to 16 dB,
    // and tune to 915 MHz.
    hackrf.set_sample_rate(20e6)?;
    hackrf.set_txvga_gain(16)?;
    hackrf.set_freq(915_000_000)?;
    hackrf.set_amp_enable(true)?;

    // Stream the file out. The stream winds down on its own at end of file,
    // after flushing the tail through the device.
    hackrf.start_tx_reader(file, |_| StreamControl::Continue)?;
    loop {
        match hackrf.is_streaming() {
            Ok(_) => std::thread::sleep(Duration::from_millis(100)),
            Err(_) => break,
        }
    }

    // Collect the stream; a fault it died on surfaces here.
    hackrf.stop_tx()?;
    Ok(())
}
