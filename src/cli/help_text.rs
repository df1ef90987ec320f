pub(super) const ROOT_LONG_ABOUT: &str = "\
Maintain and verify trees of Manifest files

A Manifest lists the size and checksums of the files in its directory. Large
trees split their Manifests up: the top-level Manifest delegates subdirectories
to nested Manifests through MANIFEST entries, which record the checksums of the
nested Manifest files themselves. Verifying the top-level Manifest (optionally
OpenPGP-signed) therefore covers the whole tree.

MANIFEST FORMAT:

  One entry per line, fields separated by spaces:

    TIMESTAMP 2024-01-01T00:00:00Z
    MANIFEST sub/Manifest.gz <size> <HASH> <value>...
    DATA|EBUILD|MISC|DIST <path> <size> <HASH> <value>...
    AUX <name under files/> <size> <HASH> <value>...
    IGNORE <path>

  Manifest files may be compressed (Manifest.gz, .bz2, .lzma, .xz).

COMMANDS:

  verify
    Check a tree (or part of it) against its Manifests. Reports missing,
    stray and modified files. Exits with status 1 if anything differs.

  update
    Record the current state of a tree (or part of it) in its Manifests,
    creating, rehashing, compressing and re-signing Manifests as needed.

  create
    Start a new tree: write a top-level Manifest and record everything below.

GLOBAL OPTIONS:

  -C <DIRECTORY>
    Change to directory before operating (like git -C or make -C).

  --config <FILE>
    Read settings from FILE instead of manitree.toml in the tree root.

  -v, --verbose / --log-level <LEVEL>
    Show more output. Either flag takes precedence over RUST_LOG.

EXIT STATUS:

  0    Success
  1    Verification found differences
  255  Any other error

For detailed help on any command, use:
  manitree <command> --help
";

pub(super) const VERIFY_LONG_ABOUT: &str = "\
Verify a tree against its Manifests

Locates the top-level Manifest above each PATH, then walks the directory tree
comparing every file with the entries recorded for it. Nested Manifests are
loaded as needed and must match the checksums their parent records.

Missing files, stray files and size or checksum differences are reported.
Without --keep-going the first difference stops verification. Crossing onto
another filesystem, symlink loops and conflicting entries always abort.

Files and directories whose names start with a dot are not walked, unless a
Manifest records them.

EXAMPLES:

  # Verify the tree containing the current directory
  $ manitree verify

  # Report every difference, not just the first
  $ manitree verify -k /var/db/repos/gentoo

  # Only check files modified since the recorded timestamp
  $ manitree verify --incremental
";

pub(super) const UPDATE_LONG_ABOUT: &str = "\
Update Manifests to match the tree

Locates the top-level Manifest above each PATH and brings every entry below
PATH up to date: new files are added, modified files rehashed and entries for
deleted files removed. Manifest files found on disk but not yet referenced are
picked up. The profile decides where new nested Manifests are created and how
new files are classified.

Changed Manifests are written back deepest first, so that each parent records
the final checksums of its children. With a compression watermark, nested
Manifests at or above that size are compressed and smaller ones decompressed
(the ebuild profiles keep the top-level Manifest uncompressed). A top-level
Manifest that was signed is signed again unless --no-sign is given.

EXAMPLES:

  # Update the whole tree
  $ manitree update

  # Update one package directory with SHA512 and BLAKE2B
  $ manitree update --hashes 'SHA512 BLAKE2B' dev-libs/foo

  # Record the time and sign the top-level Manifest
  $ manitree update --timestamp --sign --openpgp-id 0xDEADBEEF
";

pub(super) const CREATE_LONG_ABOUT: &str = "\
Create a new Manifest tree

Writes a new top-level Manifest in PATH and records every file below it, as
update would. The profile may seed the new Manifest with IGNORE entries.
Fails if PATH already contains a Manifest.

EXAMPLES:

  # Start an ebuild repository tree
  $ manitree create --profile ebuild --hashes 'BLAKE2B SHA512' --timestamp
";
