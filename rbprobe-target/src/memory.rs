//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom};
use std::path::Path;

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// リトルエンディアンのバイト配列から値を構築
    fn from_le_slice(bytes: &[u8]) -> Result<Self>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl MemoryReadable for $ty {
                fn from_le_slice(bytes: &[u8]) -> Result<Self> {
                    let array: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        anyhow::anyhow!(
                            "Failed to convert {} bytes to {} (expected {} bytes)",
                            bytes.len(),
                            stringify!($ty),
                            std::mem::size_of::<$ty>()
                        )
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn size() -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )+
    };
}

impl_memory_readable!(u8, u16, u32, u64, i64);

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub executable: bool,
    /// ファイル内オフセット
    pub offset: u64,
    /// マップされたファイルのパス（無名マッピングはNone）
    pub path: Option<String>,
}

impl MemoryMapping {
    /// /proc/pid/maps の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /usr/lib/libruby.so.3.4"
    pub fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        let perms = parts[1];
        let readable = perms.starts_with('r');
        let executable = perms.chars().nth(2) == Some('x');

        // パス名には空白が含まれることがある
        let path = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(Self {
            start,
            end,
            readable,
            executable,
            offset,
            path,
        })
    }
}

/// マッピング一覧からファイルのロードバイアスを求める
///
/// ファイルオフセット0でマップされた最初のセグメントの開始アドレスを返します。
/// パスは完全一致またはファイル名の一致で比較します。
pub fn load_bias_from_mappings(mappings: &[MemoryMapping], binary: &Path) -> Option<u64> {
    let wanted = binary.file_name()?.to_string_lossy().into_owned();
    let full = binary.to_string_lossy();

    mappings
        .iter()
        .filter(|m| m.offset == 0)
        .find(|m| match &m.path {
            Some(path) => {
                path == full.as_ref()
                    || Path::new(path)
                        .file_name()
                        .map(|name| name.to_string_lossy() == wanted)
                        .unwrap_or(false)
            }
            None => false,
        })
        .map(|m| m.start)
}

/// 稼働中プロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// 型付き値を読み取る（ジェネリック版）
    ///
    /// # Examples
    /// ```ignore
    /// let value: u64 = memory.read_typed(addr)?;
    /// ```
    pub fn read_typed<T: MemoryReadable>(&self, addr: u64) -> Result<T> {
        let bytes = self.read(addr, T::size())?;
        T::from_le_slice(&bytes)
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_typed(addr)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = MemoryMapping::parse_line(&line?) {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// バイナリ（実行ファイルまたは共有ライブラリ）のロードバイアスを取得する
    ///
    /// PIEや共有ライブラリの場合、シンボルアドレスはファイル内オフセットなので
    /// 実行時アドレスにはこの値を加算する必要があります。
    pub fn load_bias(&self, binary: &Path) -> Result<u64> {
        let mappings = self.get_mappings()?;
        load_bias_from_mappings(&mappings, binary).ok_or_else(|| {
            anyhow::anyhow!("Could not find {:?} in memory mappings of pid {}", binary, self.pid)
        })
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr as usize + offset, e)
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        data.truncate(size);
        Ok(data)
    }
}
