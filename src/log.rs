/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::{Level, Log, Metadata, Record};
use std::io;
use std::str;
use std::sync::OnceLock;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

struct SimpleLogger {
    local_offset: UtcOffset,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset);

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            if now.format_into(&mut ts, &format).is_err() {
                return;
            }

            ts.position() as usize
        };

        let ts = match str::from_utf8(&ts[..size]) {
            Ok(ts) => ts,
            Err(_) => return,
        };

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        println!("[{}] {} [{}] {}", lname, ts, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// A timestamped stdout logger for processes embedding this crate. Falls
/// back to UTC when the local offset cannot be determined.
pub fn get_simple_logger() -> &'static impl Log {
    static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

    LOGGER.get_or_init(|| {
        let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

        SimpleLogger { local_offset }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_formats_records() {
        // drive the logger directly; installing it globally would clash
        // with the logger other tests register
        let logger = get_simple_logger();

        let record = Record::builder()
            .args(format_args!("hello"))
            .level(Level::Debug)
            .target("midstream::log")
            .build();

        assert!(logger.enabled(record.metadata()));

        logger.log(&record);
        logger.flush();
    }
}
