//! ELFコアファイルの読み取り
//!
//! PT_LOADセグメントをメモリイメージとして、PT_NOTEのNT_PRSTATUSをスレッドとして、
//! NT_FILEをファイルマッピングとして扱います。

use crate::{RegisterSnapshot, Result, Thread};
use object::elf::{FileHeader64, ET_CORE, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use std::path::Path;

/// NT_PRSTATUS ノートタイプ
const NT_PRSTATUS: u32 = 1;
/// NT_FILE ノートタイプ
const NT_FILE: u32 = 0x4649_4c45;

/// elf_prstatus 内の pr_cursig のオフセット
const PRSTATUS_CURSIG_OFFSET: usize = 12;
/// elf_prstatus 内の pr_pid のオフセット
const PRSTATUS_PID_OFFSET: usize = 32;
/// elf_prstatus 内の pr_reg のオフセット（x86-64）
const PRSTATUS_REGS_OFFSET: usize = 112;

/// コアファイル内のメモリセグメント
#[derive(Debug, Clone)]
pub struct CoreSegment {
    pub vaddr: u64,
    pub memsz: u64,
    /// コアファイル内のオフセット
    pub offset: u64,
    /// ファイルに保存されているバイト数（memszより小さいことがある）
    pub filesz: u64,
}

impl CoreSegment {
    /// アドレスがこのセグメントの保存済み範囲にあるか
    fn contains_saved(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.vaddr + self.filesz
    }
}

/// NT_FILE に記録されたファイルマッピング
#[derive(Debug, Clone)]
pub struct FileMapping {
    pub start: u64,
    pub end: u64,
    /// ファイル内オフセット（バイト）
    pub file_offset: u64,
    pub path: String,
}

/// ELFコアファイル
pub struct CoreFile {
    data: Vec<u8>,
    segments: Vec<CoreSegment>,
    threads: Vec<Thread>,
    mappings: Vec<FileMapping>,
}

impl CoreFile {
    /// コアファイルを開く
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read core file {:?}: {}", path, e))?;
        Self::parse(data)
    }

    /// ファイルがELFコアファイルかどうかを判定する
    pub fn is_core_file<P: AsRef<Path>>(path: P) -> bool {
        let mut header = [0u8; 64];
        let read = std::fs::File::open(path.as_ref())
            .and_then(|mut file| std::io::Read::read(&mut file, &mut header));
        match read {
            Ok(n) if n >= 20 => {
                // e_type は e_ident(16バイト)の直後
                &header[..4] == b"\x7fELF"
                    && u16::from_le_bytes([header[16], header[17]]) == ET_CORE
            }
            _ => false,
        }
    }

    /// コアファイルのバイト列を解析する
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mut segments = Vec::new();
        let mut threads = Vec::new();
        let mut mappings = Vec::new();

        {
            let bytes: &[u8] = &data;
            let header = FileHeader64::<Endianness>::parse(bytes)
                .map_err(|e| anyhow::anyhow!("Failed to parse ELF header: {}", e))?;
            let endian = header.endian()?;

            if header.e_type(endian) != ET_CORE {
                return Err(anyhow::anyhow!("Not a core file (e_type = {})", header.e_type(endian)));
            }

            for phdr in header.program_headers(endian, bytes)? {
                match phdr.p_type(endian) {
                    PT_LOAD => segments.push(CoreSegment {
                        vaddr: phdr.p_vaddr(endian),
                        memsz: phdr.p_memsz(endian),
                        offset: phdr.p_offset(endian),
                        filesz: phdr.p_filesz(endian),
                    }),
                    PT_NOTE => {
                        let Some(mut notes) = phdr.notes(endian, bytes)? else {
                            continue;
                        };
                        while let Some(note) = notes.next()? {
                            match note.n_type(endian) {
                                NT_PRSTATUS => match parse_prstatus(note.desc()) {
                                    Ok(thread) => threads.push(thread),
                                    Err(e) => tracing::warn!("Skipping malformed NT_PRSTATUS: {}", e),
                                },
                                NT_FILE => mappings = parse_nt_file(note.desc()),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        segments.sort_by_key(|s| s.vaddr);
        tracing::debug!(
            segments = segments.len(),
            threads = threads.len(),
            mappings = mappings.len(),
            "parsed core file"
        );

        Ok(Self {
            data,
            segments,
            threads,
            mappings,
        })
    }

    /// メモリを読み取る（セグメントをまたぐ読み取りにも対応）
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(size);
        let mut cursor = addr;
        let end = addr
            .checked_add(size as u64)
            .ok_or_else(|| anyhow::anyhow!("Address range overflow at 0x{:x}", addr))?;

        while cursor < end {
            let segment = self
                .segments
                .iter()
                .find(|s| s.contains_saved(cursor))
                .ok_or_else(|| anyhow::anyhow!("Address 0x{:x} is not saved in the core file", cursor))?;

            let available = segment.vaddr + segment.filesz - cursor;
            let chunk = available.min(end - cursor) as usize;
            let start = (segment.offset + (cursor - segment.vaddr)) as usize;
            let bytes = self
                .data
                .get(start..start + chunk)
                .ok_or_else(|| anyhow::anyhow!("Core file truncated at offset 0x{:x}", start))?;

            buffer.extend_from_slice(bytes);
            cursor += chunk as u64;
        }

        Ok(buffer)
    }

    /// メモリセグメント一覧
    pub fn segments(&self) -> &[CoreSegment] {
        &self.segments
    }

    /// スレッド一覧
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// ファイルマッピング一覧
    pub fn mappings(&self) -> &[FileMapping] {
        &self.mappings
    }

    /// クラッシュ時のシグナル（最初にシグナルを持つスレッド）
    pub fn crash_signal(&self) -> Option<i32> {
        self.threads.iter().find_map(|t| t.signal())
    }

    /// バイナリのロードバイアスをNT_FILEから求める
    pub fn load_bias(&self, binary: &Path) -> Option<u64> {
        let wanted = binary.file_name()?.to_string_lossy().into_owned();
        self.mappings
            .iter()
            .filter(|m| m.file_offset == 0)
            .find(|m| {
                Path::new(&m.path)
                    .file_name()
                    .map(|name| name.to_string_lossy() == wanted)
                    .unwrap_or(false)
            })
            .map(|m| m.start)
    }
}

fn read_le_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

/// NT_PRSTATUS の内容からスレッドを構築する
fn parse_prstatus(desc: &[u8]) -> Result<Thread> {
    let words_len = crate::registers::USER_REGS_WORDS * 8;
    let regs_bytes = desc
        .get(PRSTATUS_REGS_OFFSET..PRSTATUS_REGS_OFFSET + words_len)
        .ok_or_else(|| anyhow::anyhow!("NT_PRSTATUS too short: {} bytes", desc.len()))?;

    let words: Vec<u64> = regs_bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]))
        .collect();
    let registers = RegisterSnapshot::from_user_regs_words(&words)?;

    let cursig = i16::from_le_bytes([desc[PRSTATUS_CURSIG_OFFSET], desc[PRSTATUS_CURSIG_OFFSET + 1]]);
    let pid = i32::from_le_bytes([
        desc[PRSTATUS_PID_OFFSET],
        desc[PRSTATUS_PID_OFFSET + 1],
        desc[PRSTATUS_PID_OFFSET + 2],
        desc[PRSTATUS_PID_OFFSET + 3],
    ]);

    let signal = if cursig != 0 { Some(cursig as i32) } else { None };
    Ok(Thread::new(pid, registers, signal))
}

/// NT_FILE の内容を解析する
///
/// 形式: count, page_size, (start, end, file_ofs)*count, ファイル名（NUL区切り）
fn parse_nt_file(desc: &[u8]) -> Vec<FileMapping> {
    let (Some(count), Some(page_size)) = (read_le_u64(desc, 0), read_le_u64(desc, 8)) else {
        return Vec::new();
    };

    let table_end = 16 + (count as usize) * 24;
    let Some(names) = desc.get(table_end..) else {
        return Vec::new();
    };
    let mut names = names.split(|b| *b == 0);

    let mut mappings = Vec::new();
    for i in 0..count as usize {
        let base = 16 + i * 24;
        let (Some(start), Some(end), Some(file_ofs)) = (
            read_le_u64(desc, base),
            read_le_u64(desc, base + 8),
            read_le_u64(desc, base + 16),
        ) else {
            break;
        };
        let path = names
            .next()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default();
        mappings.push(FileMapping {
            start,
            end,
            file_offset: file_ofs * page_size,
            path,
        });
    }

    mappings
}
